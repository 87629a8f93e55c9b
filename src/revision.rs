use std::fmt::Debug;

use chrono::{DateTime, NaiveDateTime, Utc};
use compact_str::CompactString;
use quick_xml::events::{BytesStart, Event};

// Source: https://github.com/mediawiki-utilities/python-mwtypes/blob/523a93f98fe1372938fc15872b5abb1f267cc643/mwtypes/timestamp.py#L12
pub const TIMESTAMP_FORMAT_LONG: &str = "%Y-%m-%dT%H:%M:%SZ";
pub const TIMESTAMP_FORMAT_SHORT: &str = "%Y%m%d%H%M%S";

/// Parse a MediaWiki timestamp, either `2003-12-05T06:41:50Z` (API) or `20031205064150` (dumps).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT_LONG)
        .or_else(|_| NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT_SHORT))
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
        .ok()
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT_LONG).to_string()
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Text {
    Normal(String),
    /// Content suppressed upstream (`texthidden`).
    Deleted,
}

impl Text {
    pub fn as_str(&self) -> &str {
        match self {
            Text::Normal(text) => text,
            Text::Deleted => "",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Text::Normal(text) => text.len(),
            Text::Deleted => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Text::Normal(text) => text.is_empty(),
            Text::Deleted => true,
        }
    }
}

impl Debug for Text {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Text::Normal(text) => write!(f, "{:?}", text),
            Text::Deleted => write!(f, "Deleted"),
        }
    }
}

/// One historical version of an article. Never mutated after it has been fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    /// Opaque, unique per article. MediaWiki uses decimal integers.
    pub id: CompactString,
    pub parent_id: Option<CompactString>,
    pub timestamp: DateTime<Utc>,
    // aka. user, absent if hidden or never recorded
    pub contributor: Option<CompactString>,
    pub comment: Option<CompactString>,
    pub text: Text,
}

#[derive(Debug, thiserror::Error)]
#[error("revision {} is missing mandatory field `{field}`", revision_id.as_deref().unwrap_or("<unknown>"))]
pub struct MalformedRevisionError {
    pub field: &'static str,
    pub revision_id: Option<CompactString>,
}

#[derive(Debug)]
pub(crate) struct RevisionBuilder {
    id: Option<CompactString>,
    parent_id: Option<CompactString>,
    timestamp: Option<DateTime<Utc>>,
    contributor: Option<CompactString>,
    comment: Option<CompactString>,
    text: Option<String>,
    text_from_slot: bool,
    text_hidden: bool,
}

impl RevisionBuilder {
    fn new() -> Self {
        Self {
            id: None,
            parent_id: None,
            timestamp: None,
            contributor: None,
            comment: None,
            text: None,
            text_from_slot: false,
            text_hidden: false,
        }
    }

    /// Start a revision from the attributes of a `<rev>` tag, as used by the API and the on-disk format:
    /// `<rev revid="1" parentid="0" user="blah" timestamp="2003-12-05T06:41:50Z" comment="blah">`
    pub(crate) fn from_rev_start(e: &BytesStart) -> Result<Self, quick_xml::Error> {
        let mut builder = Self::new();

        for attr in e.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            match attr.key.as_ref() {
                b"revid" => builder.id = Some(CompactString::from(attr.unescape_value()?.trim())),
                b"parentid" => {
                    let parent = attr.unescape_value()?;
                    // the first revision of a page reports parentid="0"
                    if !parent.is_empty() && parent != "0" {
                        builder.parent_id = Some(CompactString::from(parent.as_ref()));
                    }
                }
                b"timestamp" => {
                    let value = attr.unescape_value()?;
                    builder.timestamp = parse_timestamp(&value);
                    if builder.timestamp.is_none() {
                        tracing::warn!(
                            message = "Found invalid revision timestamp",
                            timestamp = value.as_ref()
                        );
                    }
                }
                b"user" => builder.contributor = Some(CompactString::from(attr.unescape_value()?)),
                b"comment" => builder.comment = Some(CompactString::from(attr.unescape_value()?)),
                b"texthidden" => builder.text_hidden = true,
                _ => {}
            }
        }

        Ok(builder)
    }

    /// Text directly inside `<rev>`. Ignored once a `<slot>` has been seen.
    pub(crate) fn push_text(&mut self, text: &str) {
        if !self.text_from_slot {
            self.text.get_or_insert_with(String::new).push_str(text);
        }
    }

    /// A `<slot>` starts; its content replaces anything collected directly inside `<rev>`.
    pub(crate) fn enter_slot(&mut self) {
        if !self.text_from_slot {
            self.text_from_slot = true;
            self.text = Some(String::new());
        }
    }

    pub(crate) fn push_slot_text(&mut self, text: &str) {
        self.text.get_or_insert_with(String::new).push_str(text);
    }

    pub(crate) fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub(crate) fn try_build(self) -> Result<Revision, MalformedRevisionError> {
        let Some(id) = self.id.filter(|id| !id.is_empty()) else {
            return Err(MalformedRevisionError {
                field: "revid",
                revision_id: None,
            });
        };
        let Some(timestamp) = self.timestamp else {
            return Err(MalformedRevisionError {
                field: "timestamp",
                revision_id: Some(id),
            });
        };

        let text = if self.text_hidden {
            Text::Deleted
        } else {
            Text::Normal(self.text.unwrap_or_default())
        };

        Ok(Revision {
            id,
            parent_id: self.parent_id,
            timestamp,
            contributor: self.contributor,
            comment: self.comment,
            text,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RevisionXmlError {
    #[error("XML error")]
    XmlError(#[from] quick_xml::Error),
    #[error(transparent)]
    Malformed(#[from] MalformedRevisionError),
    #[error("no <rev> element found")]
    NoRevision,
}

// tags that can appear in a stored revision file
enum Tag {
    Rev,   // <rev revid="..." timestamp="..." ...>text</rev>
    Slots, // <slots>...</slots> when written with rvslots
    Slot,  // <slot role="main" xml:space="preserve">text</slot>
    Unknown,
}

impl Tag {
    fn from_start_bytes(e: &BytesStart) -> Self {
        match e.name().as_ref() {
            b"rev" => Tag::Rev,
            b"slots" => Tag::Slots,
            b"slot" => Tag::Slot,
            _ => Tag::Unknown,
        }
    }
}

impl Revision {
    /// Serialize into the single `<rev>` element stored on disk.
    pub fn to_xml(&self) -> String {
        use quick_xml::escape::escape;

        fn push_attribute(xml: &mut String, key: &str, value: &str) {
            xml.push(' ');
            xml.push_str(key);
            xml.push_str("=\"");
            xml.push_str(&escape(value));
            xml.push('"');
        }

        let mut xml = String::with_capacity(self.text.len() + 256);
        xml.push_str("<rev");
        push_attribute(&mut xml, "revid", &self.id);
        push_attribute(
            &mut xml,
            "parentid",
            self.parent_id.as_deref().unwrap_or("0"),
        );
        match &self.contributor {
            Some(user) => push_attribute(&mut xml, "user", user),
            None => push_attribute(&mut xml, "userhidden", ""),
        }
        push_attribute(&mut xml, "timestamp", &format_timestamp(&self.timestamp));
        if let Some(comment) = &self.comment {
            push_attribute(&mut xml, "comment", comment);
        }
        match &self.text {
            Text::Normal(text) => {
                push_attribute(&mut xml, "xml:space", "preserve");
                xml.push('>');
                xml.push_str(&escape(text.as_str()));
                xml.push_str("</rev>");
            }
            Text::Deleted => {
                push_attribute(&mut xml, "texthidden", "");
                xml.push_str(" />");
            }
        }
        xml.push('\n');
        xml
    }

    /// Parse a stored revision.
    ///
    /// The body is taken from the `<rev>` element itself or from its `<slots><slot>` child,
    /// so files written by older tooling straight from the API are read as well.
    pub fn from_xml(xml: &str) -> Result<Revision, RevisionXmlError> {
        let mut reader = quick_xml::Reader::from_str(xml);
        let mut current_path: Vec<Tag> = Vec::new();
        let mut builder: Option<RevisionBuilder> = None;

        loop {
            match reader.read_event()? {
                Event::Start(ref e) => {
                    let tag = Tag::from_start_bytes(e);
                    if matches!(tag, Tag::Rev) && current_path.is_empty() {
                        builder = Some(RevisionBuilder::from_rev_start(e)?);
                    }
                    Self::enter_tag(&current_path, &tag, &mut builder);
                    current_path.push(tag);
                }
                Event::Empty(ref e) => {
                    let tag = Tag::from_start_bytes(e);
                    if matches!(tag, Tag::Rev) && current_path.is_empty() {
                        // <rev ... texthidden="" /> or a revision with no body at all
                        return Ok(RevisionBuilder::from_rev_start(e)?.try_build()?);
                    }
                    Self::enter_tag(&current_path, &tag, &mut builder);
                }
                Event::Text(e) => {
                    let text = e.unescape()?;
                    Self::collect_body(&current_path, &mut builder, &text);
                }
                Event::CData(e) => {
                    let data = e.into_inner();
                    let text = String::from_utf8_lossy(&data);
                    Self::collect_body(&current_path, &mut builder, &text);
                }
                Event::End(_) => {
                    current_path.pop();
                    if current_path.is_empty() {
                        if let Some(builder) = builder.take() {
                            return Ok(builder.try_build()?);
                        }
                    }
                }
                Event::Eof => return Err(RevisionXmlError::NoRevision),
                _ => {}
            }
        }
    }

    fn enter_tag(current_path: &[Tag], tag: &Tag, builder: &mut Option<RevisionBuilder>) {
        if let (Some(builder), [Tag::Rev, Tag::Slots], Tag::Slot) = (builder, current_path, tag) {
            builder.enter_slot();
        }
    }

    fn collect_body(current_path: &[Tag], builder: &mut Option<RevisionBuilder>, text: &str) {
        use Tag::*;

        if let Some(builder) = builder {
            match current_path {
                [Rev] => builder.push_text(text),
                [Rev, Slots, Slot] => builder.push_slot_text(text),
                _ => {}
            }
        }
    }
}
