use claim::{assert_matches, assert_ok};
use quickcheck::{Arbitrary, Gen};

use certificate_mailer::batch::Summary;
use certificate_mailer::certificate::TemplateError;
use certificate_mailer::dispatch::DispatchOutcome;
use certificate_mailer::domain::{Delimiter, RosterError};
use certificate_mailer::error::BatchError;

use crate::helpers::{
    archive_contents, batch_request, field_value, run_batch, template_pdf, FakeConnector,
    NAME_FIELD,
};

#[tokio::test]
async fn test_valid_rows_are_mailed_and_archived() {
    let connector = FakeConnector::new();
    let roster = "Nome completo,E-mail\nAna Maria,ana@ex.com\nBad Name,not-an-email\n";

    let run = run_batch(&connector, batch_request(roster)).await;
    let result = assert_ok!(run.outcome);

    assert_eq!(result.summary(), Summary { sent: 1, failed: 1 });
    assert_eq!(result.invalid(), 1);
    assert_eq!(result.entries, vec!["certificado_ana_maria.pdf".to_string()]);
    assert_eq!(connector.sent_to(), vec!["ana@ex.com".to_string()]);

    let archived = archive_contents(&result.archive);
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].0, "certificado_ana_maria.pdf");
    assert_eq!(
        field_value(&archived[0].1, NAME_FIELD),
        Some(b"Ana Maria".to_vec())
    );
}

#[tokio::test]
async fn test_sent_message_is_personalized_and_carries_the_certificate() {
    let connector = FakeConnector::new();
    let roster = "Nome completo,E-mail\nAna Maria,ana@ex.com\n";

    assert_ok!(run_batch(&connector, batch_request(roster)).await.outcome);

    let messages = connector.raw_messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Subject: Certificate for Ana Maria"));
    assert!(messages[0].contains("From: Secretaria <secretaria@escola.com>"));
    assert!(messages[0].contains("<p>Hello Ana Maria</p>"));
    assert!(messages[0].contains("application/pdf"));
    assert!(messages[0].contains("certificado_ana_maria.pdf"));
}

#[tokio::test]
async fn test_missing_columns_abort_before_connecting() {
    let connector = FakeConnector::new();
    let roster = "Nome,Email\nAna,ana@ex.com\n";

    let run = run_batch(&connector, batch_request(roster)).await;

    match run.outcome {
        Err(BatchError::Schema(RosterError::MissingColumns { missing, found })) => {
            assert_eq!(missing, vec!["Nome completo".to_string(), "E-mail".to_string()]);
            assert_eq!(found, vec!["Nome".to_string(), "Email".to_string()]);
        }
        other => panic!("unexpected outcome: {:?}", other.map(|r| r.summary())),
    }
    assert_eq!(connector.connects(), 0);
    assert!(connector.sent_to().is_empty());
    assert!(run.progress.is_empty());
}

#[tokio::test]
async fn test_template_without_the_name_field_aborts_before_connecting() {
    let connector = FakeConnector::new();
    let mut request = batch_request("Nome completo,E-mail\nAna,ana@ex.com\n");
    request.template = template_pdf(&["Outro campo"]);

    let run = run_batch(&connector, request).await;

    assert_matches!(
        run.outcome,
        Err(BatchError::Template(TemplateError::FieldMissing { .. }))
    );
    assert_eq!(connector.connects(), 0);
    assert!(run.progress.is_empty());
}

#[tokio::test]
async fn test_authentication_failure_sends_nothing() {
    let connector = FakeConnector::refusing_authentication();
    let roster = "Nome completo,E-mail\nAna,ana@ex.com\nBruno,bruno@ex.com\n";

    let run = run_batch(&connector, batch_request(roster)).await;

    assert_matches!(run.outcome, Err(BatchError::Authentication(_)));
    assert_eq!(connector.connects(), 1);
    assert!(connector.sent_to().is_empty());
    assert!(run.progress.is_empty());
}

#[tokio::test]
async fn test_unreachable_server_is_a_connection_error() {
    let connector = FakeConnector::unreachable();
    let roster = "Nome completo,E-mail\nAna,ana@ex.com\n";

    let run = run_batch(&connector, batch_request(roster)).await;

    assert_matches!(run.outcome, Err(BatchError::Connection(_)));
    assert!(connector.sent_to().is_empty());
    assert!(run.progress.is_empty());
}

#[tokio::test]
async fn test_blank_body_aborts_before_connecting() {
    let connector = FakeConnector::new();
    let mut request = batch_request("Nome completo,E-mail\nAna,ana@ex.com\n");
    request.html_body = " \n\t".into();

    let run = run_batch(&connector, request).await;

    assert_matches!(run.outcome, Err(BatchError::BlankMessage("body")));
    assert_eq!(connector.connects(), 0);
    assert!(run.progress.is_empty());
}

#[tokio::test]
async fn test_blank_subject_aborts_before_connecting() {
    let connector = FakeConnector::new();
    let mut request = batch_request("Nome completo,E-mail\nAna,ana@ex.com\n");
    request.subject = String::new();

    let run = run_batch(&connector, request).await;

    assert_matches!(run.outcome, Err(BatchError::BlankMessage("subject")));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn test_failed_send_is_recorded_and_the_batch_continues() {
    let connector = FakeConnector::rejecting(&["ana@ex.com"]);
    let roster = "Nome completo,E-mail\nAna,ana@ex.com\nBruno,bruno@ex.com\n";

    let run = run_batch(&connector, batch_request(roster)).await;
    let result = assert_ok!(run.outcome);

    assert_eq!(result.summary(), Summary { sent: 1, failed: 1 });
    assert_eq!(
        result.rows[0].outcome,
        DispatchOutcome::SendFailed("550 mailbox unavailable".into())
    );
    assert_eq!(result.rows[1].outcome, DispatchOutcome::Sent);
    assert_eq!(
        run.progress[0].message,
        "Failed (ana@ex.com): 550 mailbox unavailable"
    );
    assert_eq!(run.progress[1].message, "Sent to bruno@ex.com");
    // The certificate is archived even though it never reached the recipient
    assert_eq!(
        result.entries,
        vec!["certificado_ana.pdf".to_string(), "certificado_bruno.pdf".to_string()]
    );
    assert_eq!(connector.sent_to(), vec!["bruno@ex.com".to_string()]);
}

#[tokio::test]
async fn test_duplicate_names_get_distinct_archive_entries() {
    let connector = FakeConnector::new();
    let roster = "Nome completo,E-mail\nAna Maria,ana@ex.com\nAna Maria,ana.maria@ex.com\n";

    let result = assert_ok!(run_batch(&connector, batch_request(roster)).await.outcome);

    let names: Vec<String> = archive_contents(&result.archive)
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(
        names,
        vec![
            "certificado_ana_maria.pdf".to_string(),
            "certificado_ana_maria_2.pdf".to_string()
        ]
    );
    assert_eq!(result.rows[1].filename.as_deref(), Some("certificado_ana_maria_2.pdf"));
    assert_eq!(connector.sent_to().len(), 2);
}

#[tokio::test]
async fn test_progress_is_reported_once_per_row_and_ends_at_one() {
    let connector = FakeConnector::new();
    let roster = "Nome completo,E-mail\nAna,ana@ex.com\nBruno,bruno\nCarla,carla@ex.com\n";

    let run = run_batch(&connector, batch_request(roster)).await;
    assert_ok!(run.outcome);

    assert_eq!(run.progress.len(), 3);
    assert!(run
        .progress
        .windows(2)
        .all(|pair| pair[0].fraction < pair[1].fraction));
    assert_eq!(run.progress[2].fraction, 1.0);
    assert_eq!(run.progress[1].message, "Invalid e-mail: bruno");
}

#[tokio::test]
async fn test_session_is_closed_exactly_once() {
    let connector = FakeConnector::rejecting(&["bruno@ex.com"]);
    let roster = "Nome completo,E-mail\nAna,ana@ex.com\nBruno,bruno@ex.com\n";

    assert_ok!(run_batch(&connector, batch_request(roster)).await.outcome);

    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.closes(), 1);
}

#[tokio::test]
async fn test_semicolon_rosters_are_detected() {
    let connector = FakeConnector::new();
    let roster = "Nome completo;E-mail\nAna;ana@ex.com\nBruno;bruno@ex.com\n";

    let result = assert_ok!(run_batch(&connector, batch_request(roster)).await.outcome);

    assert_eq!(result.delimiter, Delimiter::Semicolon);
    assert_eq!(result.sent(), 2);
}

#[tokio::test]
async fn test_explicit_delimiter_is_honoured() {
    let connector = FakeConnector::new();
    let roster = "Nome completo\tE-mail\nSilva, Ana\tana@ex.com\nSouza, Bruno\tbruno@ex.com\n";
    let mut request = batch_request(roster);
    request.delimiter = Some(Delimiter::Tab);

    let result = assert_ok!(run_batch(&connector, request).await.outcome);

    assert_eq!(result.delimiter, Delimiter::Tab);
    assert_eq!(
        result.entries,
        vec!["certificado_silva,_ana.pdf".to_string(), "certificado_souza,_bruno.pdf".to_string()]
    );
}

#[tokio::test]
async fn test_empty_roster_produces_an_empty_archive() {
    let connector = FakeConnector::new();

    let run = run_batch(&connector, batch_request("Nome completo,E-mail\n")).await;
    let result = assert_ok!(run.outcome);

    assert_eq!(result.summary(), Summary { sent: 0, failed: 0 });
    assert!(archive_contents(&result.archive).is_empty());
    assert!(run.progress.is_empty());
    assert_eq!(connector.closes(), 1);
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RowKind {
    Valid,
    Invalid,
    Rejected,
}

// Both `Clone` and `Debug` are required by quickcheck
#[derive(Debug, Clone)]
struct RosterFixture(Vec<RowKind>);

impl Arbitrary for RosterFixture {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        let kinds = Vec::<u8>::arbitrary(g)
            .into_iter()
            .take(12)
            .map(|byte| match byte % 3 {
                0 => RowKind::Valid,
                1 => RowKind::Invalid,
                _ => RowKind::Rejected,
            })
            .collect();
        Self(kinds)
    }
}

impl RosterFixture {
    fn csv(&self) -> String {
        let mut roster = String::from("Nome completo,E-mail\n");
        for (i, kind) in self.0.iter().enumerate() {
            match kind {
                RowKind::Invalid => roster.push_str(&format!("Aluno {i},aluno{i}\n")),
                _ => roster.push_str(&format!("Aluno {i},aluno{i}@ex.com\n")),
            }
        }
        roster
    }

    fn rejected(&self) -> Vec<String> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, kind)| **kind == RowKind::Rejected)
            .map(|(i, _)| format!("aluno{i}@ex.com"))
            .collect()
    }

    fn count(&self, kind: RowKind) -> usize {
        self.0.iter().filter(|k| **k == kind).count()
    }
}

#[quickcheck_macros::quickcheck]
fn test_every_row_is_counted_exactly_once(fixture: RosterFixture) -> bool {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let connector = FakeConnector::rejecting(&fixture.rejected());
    let run = runtime.block_on(run_batch(&connector, batch_request(&fixture.csv())));
    let result = match run.outcome {
        Ok(result) => result,
        Err(_) => return false,
    };

    let rows = fixture.0.len();
    result.sent() + result.send_failed() + result.invalid() == rows
        && result.rows.len() == rows
        && run.progress.len() == rows
        && result.sent() == fixture.count(RowKind::Valid)
        && result.send_failed() == fixture.count(RowKind::Rejected)
        && result.invalid() == fixture.count(RowKind::Invalid)
        && result.entries.len() == rows - fixture.count(RowKind::Invalid)
        && connector.closes() == 1
}
