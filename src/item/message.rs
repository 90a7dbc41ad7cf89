//! Message and attachment accessors over [`Item`] properties.

use crate::error::Result;
use crate::record::codepage::decode_codepage;
use crate::record::{tags, FileTime, PropertyValue};

use super::Item;

/// Drop the normalized-subject prefix marker: `U+0001` followed by the
/// prefix length character.
fn strip_subject_marker(subject: &str) -> &str {
    let mut chars = subject.chars();
    if chars.next() == Some('\u{1}') {
        chars.next();
        return chars.as_str();
    }
    subject
}

impl<'c> Item<'c> {
    fn text(&self, id: u16) -> Result<Option<String>> {
        Ok(self.properties()?.string(id).map(str::to_owned))
    }

    fn timestamp(&self, id: u16) -> Result<Option<FileTime>> {
        Ok(self.properties()?.time(id))
    }

    // ── Message ──────────────────────────────────────────────────────────────

    pub fn subject(&self) -> Result<Option<String>> {
        Ok(self.properties()?.string(tags::SUBJECT).map(|s| strip_subject_marker(s).to_owned()))
    }

    pub fn conversation_topic(&self) -> Result<Option<String>> {
        self.text(tags::CONVERSATION_TOPIC)
    }

    pub fn sender_name(&self) -> Result<Option<String>> {
        match self.text(tags::SENDER_NAME)? {
            Some(name) => Ok(Some(name)),
            None => self.text(tags::SENT_REPRESENTING_NAME),
        }
    }

    pub fn sender_email_address(&self) -> Result<Option<String>> {
        self.text(tags::SENDER_EMAIL_ADDRESS)
    }

    pub fn display_to(&self) -> Result<Option<String>> {
        self.text(tags::DISPLAY_TO)
    }

    pub fn plain_text_body(&self) -> Result<Option<String>> {
        self.text(tags::BODY)
    }

    /// HTML body; stored either as a string or as bytes in the message's
    /// internet codepage.
    pub fn html_body(&self) -> Result<Option<String>> {
        let props = self.properties()?;
        Ok(match props.get(tags::BODY_HTML) {
            Some(PropertyValue::Binary(bytes)) => {
                let codepage = props
                    .integer(tags::INTERNET_CODEPAGE)
                    .map_or(self.container.ascii_codepage(), |cp| cp as u16);
                Some(decode_codepage(bytes, codepage))
            }
            Some(other) => other.as_str().map(str::to_owned),
            None => None,
        })
    }

    /// Compressed RTF body as stored.
    pub fn rtf_body(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.properties()?.bytes(tags::RTF_COMPRESSED).map(<[u8]>::to_vec))
    }

    pub fn transport_headers(&self) -> Result<Option<String>> {
        self.text(tags::TRANSPORT_HEADERS)
    }

    pub fn delivery_time(&self) -> Result<Option<FileTime>> {
        self.timestamp(tags::MESSAGE_DELIVERY_TIME)
    }

    pub fn client_submit_time(&self) -> Result<Option<FileTime>> {
        self.timestamp(tags::CLIENT_SUBMIT_TIME)
    }

    pub fn creation_time(&self) -> Result<Option<FileTime>> {
        self.timestamp(tags::CREATION_TIME)
    }

    pub fn modification_time(&self) -> Result<Option<FileTime>> {
        self.timestamp(tags::LAST_MODIFICATION_TIME)
    }

    pub fn message_flags(&self) -> Result<Option<i64>> {
        Ok(self.properties()?.integer(tags::MESSAGE_FLAGS))
    }

    // ── Attachment ───────────────────────────────────────────────────────────

    /// Attachment data, for attachments stored by value.
    pub fn read_data(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.properties()?.bytes(tags::ATTACH_DATA).map(<[u8]>::to_vec))
    }

    /// Declared size, falling back to the size of the stored data.
    pub fn size(&self) -> Result<Option<u64>> {
        let props = self.properties()?;
        if let Some(size) = props.integer(tags::ATTACH_SIZE) {
            return Ok(Some(size as u64));
        }
        Ok(props.bytes(tags::ATTACH_DATA).map(|b| b.len() as u64))
    }

    pub fn filename(&self) -> Result<Option<String>> {
        match self.text(tags::ATTACH_LONG_FILENAME)? {
            Some(name) => Ok(Some(name)),
            None => self.text(tags::ATTACH_FILENAME),
        }
    }

    pub fn attach_method(&self) -> Result<Option<i64>> {
        Ok(self.properties()?.integer(tags::ATTACH_METHOD))
    }

    pub fn mime_type(&self) -> Result<Option<String>> {
        self.text(tags::ATTACH_MIME_TAG)
    }
}
