use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;

use claim::assert_ok;
use lettre::Message;
use secrecy::Secret;

use certificate_mailer::configuration::SmtpSettings;
use certificate_mailer::dispatch::{
    DispatchError, DispatchOutcome, DispatchSession, SessionState, SmtpConnector,
};

/// How the scripted server answers.
#[derive(Clone)]
struct Script {
    accept_credentials: bool,
    /// `RCPT TO` for any of these gets a `550`
    rejected_recipients: Vec<&'static str>,
    /// Connections served before the server stops listening
    connections: usize,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            accept_credentials: true,
            rejected_recipients: Vec::new(),
            connections: 1,
        }
    }
}

/// Plain-text SMTP server on a random local port. Returns the command verbs
/// it received across every connection, in order.
fn scripted_server(script: Script) -> (u16, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();
    let handle = std::thread::spawn(move || {
        let mut verbs = Vec::new();
        for _ in 0..script.connections {
            let (stream, _) = listener.accept().unwrap();
            verbs.extend(serve(stream, &script));
        }
        verbs
    });
    (port, handle)
}

fn serve(stream: TcpStream, script: &Script) -> Vec<String> {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    let mut verbs = Vec::new();

    reply(&mut writer, "220 localhost ESMTP ready\r\n");
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let verb = line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        verbs.push(verb.clone());
        let rejected = script
            .rejected_recipients
            .iter()
            .any(|recipient| line.contains(recipient));
        match verb.as_str() {
            "EHLO" => reply(&mut writer, "250-localhost\r\n250 AUTH PLAIN LOGIN\r\n"),
            "AUTH" if script.accept_credentials => reply(&mut writer, "235 2.7.0 Accepted\r\n"),
            "AUTH" => reply(&mut writer, "535 5.7.8 Authentication failed\r\n"),
            "RCPT" if rejected => reply(&mut writer, "550 5.1.1 no such user\r\n"),
            "MAIL" | "RCPT" | "RSET" | "NOOP" => reply(&mut writer, "250 OK\r\n"),
            "DATA" => {
                reply(&mut writer, "354 End data with <CR><LF>.<CR><LF>\r\n");
                loop {
                    let mut data = String::new();
                    if reader.read_line(&mut data).unwrap_or(0) == 0 || data == ".\r\n" {
                        break;
                    }
                }
                reply(&mut writer, "250 OK queued\r\n");
            }
            "QUIT" => {
                reply(&mut writer, "221 Bye\r\n");
                break;
            }
            _ => reply(&mut writer, "502 Command not implemented\r\n"),
        }
    }
    verbs
}

fn reply(writer: &mut TcpStream, line: &str) {
    writer.write_all(line.as_bytes()).unwrap();
    writer.flush().unwrap();
}

fn smtp_settings(port: u16) -> SmtpSettings {
    SmtpSettings {
        host: "127.0.0.1".into(),
        port,
        username: "secretaria@escola.com".into(),
        password: Secret::new("hunter2".into()),
        require_tls: false,
        timeout_milliseconds: 2_000,
        ..SmtpSettings::default()
    }
}

fn message() -> Message {
    message_to("ana@ex.com")
}

fn message_to(recipient: &str) -> Message {
    Message::builder()
        .from("secretaria@escola.com".parse().unwrap())
        .to(recipient.parse().unwrap())
        .subject("Certificate")
        .body(String::from("Hello Ana"))
        .unwrap()
}

#[tokio::test]
async fn test_authenticated_session_sends_and_quits() {
    let (port, server) = scripted_server(Script::default());
    let connector = SmtpConnector::new(smtp_settings(port));

    let mut session = assert_ok!(DispatchSession::open(&connector).await);
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.send(&message()).await, DispatchOutcome::Sent);
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);

    let verbs = server.join().unwrap();
    assert_eq!(verbs, vec!["EHLO", "AUTH", "MAIL", "RCPT", "DATA", "QUIT"]);
}

#[tokio::test]
async fn test_rejected_credentials_are_an_authentication_error() {
    let (port, server) = scripted_server(Script {
        accept_credentials: false,
        ..Script::default()
    });
    let connector = SmtpConnector::new(smtp_settings(port));

    match DispatchSession::open(&connector).await {
        Err(DispatchError::Authentication(_)) => {}
        Err(e) => panic!("unexpected error: {:?}", e),
        Ok(_) => panic!("authenticated with rejected credentials"),
    }
    let verbs = server.join().unwrap();
    assert!(!verbs.contains(&"MAIL".to_string()));
}

#[tokio::test]
async fn test_unreachable_server_is_a_connection_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind random port");
        listener.local_addr().unwrap().port()
    };
    let connector = SmtpConnector::new(smtp_settings(port));

    match DispatchSession::open(&connector).await {
        Err(DispatchError::Connection { host, port: p, .. }) => {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(p, port);
        }
        Err(e) => panic!("unexpected error: {:?}", e),
        Ok(_) => panic!("connected to a closed port"),
    }
}

#[tokio::test]
async fn test_rejected_recipient_does_not_break_the_session() {
    // lettre drops the connection after the 550, so the second message
    // arrives on a fresh, re-authenticated connection
    let (port, server) = scripted_server(Script {
        rejected_recipients: vec!["bad@ex.com"],
        connections: 2,
        ..Script::default()
    });
    let connector = SmtpConnector::new(smtp_settings(port));
    let mut session = assert_ok!(DispatchSession::open(&connector).await);

    let rejected = session.send(&message_to("bad@ex.com")).await;
    let accepted = session.send(&message_to("good@ex.com")).await;
    assert_eq!(session.state(), SessionState::Authenticated);
    session.close().await;

    match rejected {
        DispatchOutcome::SendFailed(reason) => assert!(reason.contains("550"), "{}", reason),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(accepted, DispatchOutcome::Sent);

    let verbs = server.join().unwrap();
    let count = |verb: &str| verbs.iter().filter(|v| v.as_str() == verb).count();
    assert_eq!(count("EHLO"), 2);
    assert_eq!(count("AUTH"), 2);
    assert_eq!(count("DATA"), 1);
    assert_eq!(verbs.last().map(String::as_str), Some("QUIT"));
}
