use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};

use crate::domain::RecipientName;

/// Bit 1 of a field's `/Ff` mask.
const READ_ONLY: i64 = 1;

/// Used when `/DA` asks for auto-sizing (size 0) or sets no size at all.
const DEFAULT_FONT_SIZE: f32 = 12.0;
/// Resource name of the Helvetica font in generated appearance streams.
const APPEARANCE_FONT: &str = "Helv";
/// Bound on `/Parent` hops when looking up inheritable field attributes.
const MAX_FIELD_DEPTH: usize = 32;

#[derive(thiserror::Error, Debug)]
pub enum TemplateError {
    #[error(
        "The template does not contain the field '{field}'. Available fields: {}",
        .available.join(", ")
    )]
    FieldMissing {
        field: String,
        available: Vec<String>,
    },
    #[error("The template is not a readable PDF document")]
    Unreadable(#[source] lopdf::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum CertificateError {
    #[error("Failed to decode the template")]
    Decode(#[source] lopdf::Error),
    #[error("Field '{0}' is no longer reachable in the decoded template")]
    FieldUnreachable(String),
    #[error("Failed to update field '{field}'")]
    Update {
        field: String,
        #[source]
        source: lopdf::Error,
    },
    #[error("Failed to serialize the certificate")]
    Serialize(#[source] anyhow::Error),
}

/// A personalized certificate, ready to be archived and attached.
#[derive(Debug, Clone)]
pub struct GeneratedDocument {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// An immutable PDF form that exposes the field receiving the recipient name.
///
/// Construction is the once-per-batch precondition check: a template that
/// does not expose `field` is never built. Every [`personalize`] call decodes
/// the template bytes afresh, so rows cannot leak state into each other.
///
/// [`personalize`]: CertificateTemplate::personalize
#[derive(Debug, Clone)]
pub struct CertificateTemplate {
    bytes: Arc<[u8]>,
    field: String,
    field_names: BTreeSet<String>,
    #[cfg(test)]
    fail_for: Option<String>,
}

impl CertificateTemplate {
    #[tracing::instrument(name = "Check certificate template", skip(bytes), fields(bytes = bytes.len()))]
    pub fn new(bytes: Vec<u8>, field: &str) -> Result<Self, TemplateError> {
        let document = Document::load_mem(&bytes).map_err(TemplateError::Unreadable)?;
        let field_names: BTreeSet<String> = form_fields(&document)
            .map_err(TemplateError::Unreadable)?
            .into_iter()
            .map(|(_, name)| name)
            .collect();

        if !field_names.contains(field) {
            return Err(TemplateError::FieldMissing {
                field: field.to_owned(),
                available: field_names.into_iter().collect(),
            });
        }

        Ok(Self {
            bytes: bytes.into(),
            field: field.to_owned(),
            field_names,
            #[cfg(test)]
            fail_for: None,
        })
    }

    /// A template whose personalization breaks for one recipient.
    #[cfg(test)]
    pub(crate) fn failing_for(mut self, name: &str) -> Self {
        self.fail_for = Some(name.to_owned());
        self
    }

    /// Fully qualified names of every form field in the template.
    pub fn field_names(&self) -> &BTreeSet<String> {
        &self.field_names
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Sets the field value to `name`, locks the field and serializes the
    /// result. Output is byte-identical for identical inputs.
    pub fn personalize(&self, name: &RecipientName) -> Result<Vec<u8>, CertificateError> {
        #[cfg(test)]
        if self.fail_for.as_deref() == Some(name.as_ref()) {
            return Err(CertificateError::FieldUnreachable(self.field.clone()));
        }

        let mut document = Document::load_mem(&self.bytes).map_err(CertificateError::Decode)?;

        let targets: Vec<ObjectId> = form_fields(&document)
            .map_err(CertificateError::Decode)?
            .into_iter()
            .filter(|(_, field_name)| field_name == &self.field)
            .map(|(id, _)| id)
            .collect();
        if targets.is_empty() {
            return Err(CertificateError::FieldUnreachable(self.field.clone()));
        }

        let update_error = |source| CertificateError::Update {
            field: self.field.clone(),
            source,
        };
        let mut widget_ids = Vec::new();
        for &id in &targets {
            widget_ids.extend(widgets(&document, id).map_err(update_error)?);
        }

        for id in targets {
            let field = document
                .get_object_mut(id)
                .and_then(Object::as_dict_mut)
                .map_err(update_error)?;
            let flags = field.get(b"Ff").and_then(Object::as_i64).unwrap_or(0);
            field.set("V", text_string(name.as_ref()));
            field.set("Ff", Object::Integer(flags | READ_ONLY));
        }

        // The template's own appearance shows the empty field, so every widget
        // gets a fresh one. `NeedAppearances` lets viewers that can rebuild
        // appearances from `/V` do so anyway.
        if !widget_ids.is_empty() {
            let font_id = document.add_object(dictionary! {
                "Type" => "Font",
                "Subtype" => "Type1",
                "BaseFont" => "Helvetica",
                "Encoding" => "WinAnsiEncoding",
            });
            for id in widget_ids {
                write_appearance(&mut document, id, font_id, name.as_ref()).map_err(update_error)?;
            }
        }
        request_appearance_regeneration(&mut document).map_err(update_error)?;

        let mut bytes = Vec::new();
        document
            .save_to(&mut bytes)
            .map_err(|e| CertificateError::Serialize(e.into()))?;
        Ok(bytes)
    }
}

/// Viewers rebuild the widget appearance from `/V` when this flag is set.
fn request_appearance_regeneration(document: &mut Document) -> lopdf::Result<()> {
    let root_id = document.trailer.get(b"Root")?.as_reference()?;
    let acroform = match document.get_object(root_id)?.as_dict()?.get(b"AcroForm")? {
        Object::Reference(id) => Some(*id),
        _ => None,
    };
    let acroform = match acroform {
        Some(id) => document.get_object_mut(id)?.as_dict_mut()?,
        None => document
            .get_object_mut(root_id)?
            .as_dict_mut()?
            .get_mut(b"AcroForm")?
            .as_dict_mut()?,
    };
    acroform.set("NeedAppearances", Object::Boolean(true));
    Ok(())
}

/// The widget annotations of a field: its `/Kids` without a `/T` of their
/// own, or the field itself when field and widget are merged.
fn widgets(document: &Document, field_id: ObjectId) -> lopdf::Result<Vec<ObjectId>> {
    let field = document.get_object(field_id)?.as_dict()?;
    let mut widgets = Vec::new();
    if let Ok(kids) = field.get(b"Kids") {
        for kid in resolve(document, kids)?.as_array()? {
            if let Ok(id) = kid.as_reference() {
                if !document.get_object(id)?.as_dict()?.has(b"T") {
                    widgets.push(id);
                }
            }
        }
    }
    if field.has(b"Rect") {
        widgets.push(field_id);
    }
    Ok(widgets)
}

/// Replaces the widget's normal appearance with a form XObject that draws
/// `text` in Helvetica, honouring the field's `/DA` font size and `/Q`
/// alignment.
fn write_appearance(
    document: &mut Document,
    widget_id: ObjectId,
    font_id: ObjectId,
    text: &str,
) -> lopdf::Result<()> {
    let widget = document.get_object(widget_id)?.as_dict()?;
    let rect: Vec<f32> = resolve(document, widget.get(b"Rect")?)?
        .as_array()?
        .iter()
        .filter_map(number)
        .collect();
    if rect.len() != 4 {
        return Ok(());
    }
    let width = (rect[2] - rect[0]).abs();
    let height = (rect[3] - rect[1]).abs();
    let size = font_size(
        inherited(document, widget, b"DA").and_then(|da| da.as_str().ok()),
        height,
    );
    let quadding = inherited(document, widget, b"Q")
        .and_then(|q| q.as_i64().ok())
        .unwrap_or(0);

    let encoded = win_ansi(text);
    // Helvetica glyphs average about half an em
    let text_width = encoded.len() as f32 * size * 0.5;
    let x = match quadding {
        1 => ((width - text_width) / 2.0).max(2.0),
        2 => (width - text_width - 2.0).max(2.0),
        _ => 2.0,
    };
    // Centres the cap height vertically
    let y = ((height - size * 0.7) / 2.0).max(0.0);

    let content = Content {
        operations: vec![
            Operation::new("BMC", vec!["Tx".into()]),
            Operation::new("q", vec![]),
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![APPEARANCE_FONT.into(), Object::Real(size.into())]),
            Operation::new("Td", vec![Object::Real(x.into()), Object::Real(y.into())]),
            Operation::new("Tj", vec![Object::String(encoded, StringFormat::Literal)]),
            Operation::new("ET", vec![]),
            Operation::new("Q", vec![]),
            Operation::new("EMC", vec![]),
        ],
    };
    let appearance = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "BBox" => vec![0.into(), 0.into(), Object::Real(width.into()), Object::Real(height.into())],
            "Resources" => dictionary! {
                "Font" => dictionary! { APPEARANCE_FONT => font_id },
            },
        },
        content.encode()?,
    );
    let appearance_id = document.add_object(appearance);

    document
        .get_object_mut(widget_id)?
        .as_dict_mut()?
        .set("AP", dictionary! { "N" => appearance_id });
    Ok(())
}

/// Looks `key` up on `dict`, then along its `/Parent` chain.
fn inherited<'a>(document: &'a Document, dict: &'a Dictionary, key: &[u8]) -> Option<&'a Object> {
    let mut current = dict;
    for _ in 0..MAX_FIELD_DEPTH {
        if let Ok(value) = current.get(key) {
            return Some(value);
        }
        let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
        current = document.get_object(parent).ok()?.as_dict().ok()?;
    }
    None
}

/// The size operand of the `Tf` operator in a `/DA` string.
fn font_size(default_appearance: Option<&[u8]>, height: f32) -> f32 {
    let requested = default_appearance.and_then(|da| {
        let da = String::from_utf8_lossy(da);
        let tokens: Vec<&str> = da.split_whitespace().collect();
        tokens
            .windows(2)
            .find(|pair| pair[1] == "Tf")
            .and_then(|pair| pair[0].parse::<f32>().ok())
    });
    match requested {
        Some(size) if size > 0.0 => size,
        _ => DEFAULT_FONT_SIZE.min(height * 0.7),
    }
}

fn number(object: &Object) -> Option<f32> {
    match *object {
        Object::Integer(value) => Some(value as f32),
        Object::Real(value) => Some(value as f32),
        _ => None,
    }
}

/// WinAnsiEncoding agrees with Latin-1 for letters; anything outside it
/// becomes `?`.
fn win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match u8::try_from(u32::from(c)) {
            Ok(byte) => byte,
            Err(_) => b'?',
        })
        .collect()
}

fn resolve<'a>(document: &'a Document, object: &'a Object) -> lopdf::Result<&'a Object> {
    match object {
        Object::Reference(id) => document.get_object(*id),
        other => Ok(other),
    }
}

/// Walks the AcroForm field tree and returns every terminal or intermediate
/// field that carries a partial name, keyed by its fully qualified name
/// (`parent.child`). Kids without `/T` are widgets of their parent.
fn form_fields(document: &Document) -> lopdf::Result<Vec<(ObjectId, String)>> {
    let root_id = document.trailer.get(b"Root")?.as_reference()?;
    let catalog = document.get_object(root_id)?.as_dict()?;
    let acroform = match catalog.get(b"AcroForm") {
        Ok(acroform) => resolve(document, acroform)?.as_dict()?,
        // A document without a form simply has no fields
        Err(_) => return Ok(Vec::new()),
    };
    let roots = match acroform.get(b"Fields") {
        Ok(fields) => resolve(document, fields)?.as_array()?,
        Err(_) => return Ok(Vec::new()),
    };

    let mut pending: Vec<(ObjectId, Option<String>)> = roots
        .iter()
        .rev()
        .filter_map(|field| field.as_reference().ok())
        .map(|id| (id, None))
        .collect();
    let mut visited = HashSet::new();
    let mut fields = Vec::new();

    while let Some((id, parent)) = pending.pop() {
        if !visited.insert(id) {
            continue;
        }
        let field = document.get_object(id)?.as_dict()?;
        let partial = field
            .get(b"T")
            .and_then(Object::as_str)
            .ok()
            .map(decode_text_string);
        let name = match (parent, partial) {
            (Some(parent), Some(partial)) => {
                let name = format!("{}.{}", parent, partial);
                fields.push((id, name.clone()));
                Some(name)
            }
            (None, Some(partial)) => {
                fields.push((id, partial.clone()));
                Some(partial)
            }
            (parent, None) => parent,
        };

        if let Ok(kids) = field.get(b"Kids") {
            for kid in resolve(document, kids)?.as_array()?.iter().rev() {
                if let Ok(kid) = kid.as_reference() {
                    pending.push((kid, name.clone()));
                }
            }
        }
    }

    Ok(fields)
}

/// PDF text strings are PDFDocEncoded or UTF-16BE behind a byte order mark.
fn text_string(text: &str) -> Object {
    if text.is_ascii() {
        Object::string_literal(text)
    } else {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        Object::String(bytes, StringFormat::Hexadecimal)
    }
}

fn decode_text_string(bytes: &[u8]) -> String {
    match bytes.strip_prefix(&[0xFE, 0xFF]) {
        Some(utf16) => {
            let units: Vec<u16> = utf16
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        // PDFDocEncoding agrees with Latin-1 for every printable character
        None => bytes.iter().map(|&b| b as char).collect(),
    }
}
