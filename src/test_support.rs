use std::collections::VecDeque;

use chrono::DateTime;
use quick_xml::escape::escape;

use crate::{
    api::{RevisionApi, RevisionPage, RevisionQuery, TransportError},
    revision::{parse_timestamp, Revision, Text},
};

pub mod prelude {
    pub(crate) use super::proptest as proptest_support;
    pub(crate) use super::{
        api_response, dummy_revision, missing_page_response, revision_page, timed_revision,
        ScriptedApi,
    };
    pub(crate) use proptest::prelude::*;
}

pub fn dummy_revision() -> Revision {
    Revision {
        id: "0".into(),
        parent_id: None,
        timestamp: DateTime::from_timestamp_nanos(0),
        contributor: Some("Dummy".into()),
        comment: None,
        text: Text::Deleted,
    }
}

pub fn timed_revision(id: &str, timestamp: &str) -> Revision {
    Revision {
        id: id.into(),
        timestamp: parse_timestamp(timestamp).unwrap(),
        text: Text::Normal(format!("Revision {id}.")),
        ..dummy_revision()
    }
}

pub fn revision_page(revisions: Vec<Revision>, cursor: Option<&str>) -> RevisionPage {
    RevisionPage {
        revisions,
        cursor: cursor.map(str::to_string),
        ..RevisionPage::default()
    }
}

/// Pages served in order; once they are used up, every further query gets an empty final page.
pub struct ScriptedApi {
    responses: VecDeque<Result<RevisionPage, TransportError>>,
    pub queries: Vec<RevisionQuery>,
}

impl ScriptedApi {
    pub fn new(pages: impl IntoIterator<Item = RevisionPage>) -> Self {
        Self {
            responses: pages.into_iter().map(Ok).collect(),
            queries: Vec::new(),
        }
    }

    pub fn push_error(&mut self, error: TransportError) {
        self.responses.push_back(Err(error));
    }
}

impl RevisionApi for ScriptedApi {
    fn query_revisions(&mut self, query: &RevisionQuery) -> Result<RevisionPage, TransportError> {
        self.queries.push(query.clone());
        self.responses
            .pop_front()
            .unwrap_or_else(|| Ok(RevisionPage::default()))
    }

    fn request_count(&self) -> usize {
        self.queries.len()
    }
}

/// A `format=xml` revisions query response, revision bodies directly inside `<rev>`.
pub fn api_response(article: &str, revisions: &[Revision], cursor: Option<&str>) -> String {
    let mut xml = String::from("<?xml version=\"1.0\"?><api batchcomplete=\"\">");
    if let Some(cursor) = cursor {
        xml.push_str(&format!(
            "<continue rvcontinue=\"{}\" continue=\"||\" />",
            escape(cursor)
        ));
    }
    xml.push_str(&format!(
        "<query><pages><page _idx=\"736\" pageid=\"736\" ns=\"0\" title=\"{}\"><revisions>",
        escape(article)
    ));
    for revision in revisions {
        xml.push_str(&revision.to_xml());
    }
    xml.push_str("</revisions></page></pages></query></api>");
    xml
}

pub fn missing_page_response(article: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?><api batchcomplete=\"\"><query><pages><page _idx=\"-1\" ns=\"0\" title=\"{}\" missing=\"\" /></pages></query></api>",
        escape(article)
    )
}

pub mod proptest {
    use proptest::prelude::*;
    use proptest::strategy::Strategy;

    pub fn word() -> impl Strategy<Value = String> {
        "[A-Za-z0-9][A-Za-z0-9.,']{0,8}"
    }

    fn words() -> impl Strategy<Value = String> {
        proptest::collection::vec(word(), 1..4).prop_map(|words| words.join(" "))
    }

    pub fn link() -> impl Strategy<Value = String> {
        prop_oneof![
            words().prop_map(|target| format!("[[{target}]]")),
            (words(), words()).prop_map(|(target, display)| format!("[[{target}|{display}]]")),
        ]
    }

    /// A template parameter reference, `{{{1}}}` or `{{{name|default}}}`.
    pub fn template_parameter() -> impl Strategy<Value = String> {
        ("[a-z0-9]{1,5}", proptest::option::of(word())).prop_map(|(name, default)| {
            let mut parameter = String::from("{{{");
            parameter.push_str(&name);
            if let Some(default) = default {
                parameter.push('|');
                parameter.push_str(&default);
            }
            parameter.push_str("}}}");
            parameter
        })
    }

    /// Templates nested up to three levels deep, with links and parameters among their arguments.
    pub fn template() -> impl Strategy<Value = String> {
        fn render(name: &str, args: &[String]) -> String {
            let mut template = String::from("{{");
            template.push_str(name);
            for arg in args {
                template.push_str("|x=");
                template.push_str(arg);
            }
            template.push_str("}}");
            template
        }

        let leaf = ("[A-Za-z][A-Za-z ]{0,10}", proptest::collection::vec(word(), 0..3))
            .prop_map(|(name, args)| render(&name, &args));
        leaf.prop_recursive(3, 16, 3, |inner| {
            (
                "[A-Za-z][A-Za-z ]{0,10}",
                proptest::collection::vec(
                    prop_oneof![word(), inner, link(), template_parameter()],
                    0..3,
                ),
            )
                .prop_map(|(name, args)| render(&name, &args))
        })
    }

    pub fn file_embed() -> impl Strategy<Value = String> {
        (
            prop_oneof![Just("File"), Just("Image"), Just("file")],
            word(),
            proptest::collection::vec(prop_oneof![words(), link(), external_link()], 0..3),
        )
            .prop_map(|(prefix, name, caption)| {
                format!("[[{prefix}:{name}.jpg|thumb|{}]]", caption.join(" "))
            })
    }

    fn reference_content() -> impl Strategy<Value = String> {
        proptest::collection::vec(prop_oneof![words(), link(), template()], 0..3)
            .prop_map(|parts| parts.join(" "))
    }

    pub fn reference() -> impl Strategy<Value = String> {
        prop_oneof![
            reference_content().prop_map(|content| format!("<ref>{content}</ref>")),
            (word(), reference_content())
                .prop_map(|(name, content)| format!("<ref name=\"{name}\">{content}</ref>")),
            word().prop_map(|name| format!("<ref name=\"{name}\" />")),
        ]
    }

    pub fn tag() -> impl Strategy<Value = String> {
        prop_oneof![
            words().prop_map(|text| format!("<b>{text}</b>")),
            words().prop_map(|text| format!("<span style=\"color:red\">{text}</span>")),
            Just("<br />".to_string()),
            words().prop_map(|text| format!("<!-- {text} -->")),
        ]
    }

    /// A table, sometimes with a second table nested in one of its cells.
    pub fn table() -> impl Strategy<Value = String> {
        fn render(class: &str, cells: &[String], nested: Option<&str>) -> String {
            let mut table = format!("\n{{| class=\"{class}\"\n|-\n| {}\n", cells.join(" || "));
            if let Some(nested) = nested {
                table.push_str("|-\n|");
                table.push_str(nested);
                table.push_str("| tail\n");
            }
            table.push_str("|}\n");
            table
        }

        (
            proptest::collection::vec(word(), 1..5),
            proptest::option::of(proptest::collection::vec(word(), 1..3)),
        )
            .prop_map(|(cells, inner)| {
                let nested = inner.map(|inner| render("inner", &inner, None));
                render("wikitable", &cells, nested.as_deref())
            })
    }

    pub fn heading() -> impl Strategy<Value = String> {
        (2usize..5, words()).prop_map(|(level, title)| {
            let marker = "=".repeat(level);
            format!("\n{marker} {title} {marker}\n")
        })
    }

    pub fn escaped() -> impl Strategy<Value = String> {
        prop_oneof![
            words().prop_map(|text| format!("&lt;b&gt;{text}&lt;/b&gt;")),
            Just(" &amp; ".to_string()),
            words().prop_map(|text| format!("&lt;ref&gt;{text}&lt;/ref&gt;")),
        ]
    }

    pub fn other_links() -> impl Strategy<Value = String> {
        prop_oneof![
            words().prop_map(|name| format!("[[Category:{name}]]")),
            words().prop_map(|title| format!("[[de:{title}]]")),
            external_link(),
        ]
    }

    pub fn external_link() -> impl Strategy<Value = String> {
        (word(), words()).prop_map(|(path, text)| format!("[https://example.org/{path} {text}]"))
    }

    pub fn whitespace() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(" ".to_string()),
            Just("\n".to_string()),
            Just("\n\n".to_string()),
            Just("\t".to_string()),
            Just("  \r\n".to_string()),
        ]
    }

    /// Article markup built from well-formed fragments of every kind the normalizer removes.
    pub fn wikitext() -> impl Strategy<Value = String> {
        let fragment = prop_oneof![
            8 => words(),
            6 => whitespace(),
            3 => link(),
            2 => template(),
            1 => file_embed(),
            2 => reference(),
            2 => tag(),
            1 => table(),
            2 => heading(),
            2 => prop_oneof![escaped(), other_links()],
        ];
        proptest::collection::vec(fragment, 0..30).prop_map(|parts| parts.concat())
    }

    /// Plain text lines mixed with heading lines, including `=` runs inside ordinary lines.
    pub fn sectioned_text() -> impl Strategy<Value = String> {
        let line = prop_oneof![
            4 => "[a-z ]{0,20}",
            2 => "[a-z]{1,5} ={2,3} [a-z]{1,5}",
            3 => (2usize..5, "[A-Za-z][A-Za-z ]{0,12}").prop_map(|(level, title)| {
                let marker = "=".repeat(level);
                format!("{marker} {title} {marker}")
            }),
        ];
        proptest::collection::vec(line, 0..20).prop_map(|lines| lines.join("\n"))
    }
}
