//! XML feed reader.
//!
//! The document is first read into a small element tree with quick-xml and
//! then walked:
//!
//! ```text
//! Feed [BaseUrl]
//! └── Tasks
//!     ├── <StepName attr=...>
//!     │   ├── Description
//!     │   └── Conditions
//!     │       ├── <ConditionName type=... attr=...>
//!     │       └── GroupCondition type=...
//!     └── ...
//! ```

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, instrument, warn};

use super::{FeedDocument, FeedReader, Registry};
use crate::attributes::Attributes;
use crate::conditions::{Combinator, Condition, ConditionGroup};
use crate::error::{Result, UpdateError};
use crate::steps::Step;

#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Attributes,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(name))
    }
}

fn feed_error(e: impl std::fmt::Display) -> UpdateError {
    UpdateError::Feed(e.to_string())
}

fn start_element(start: &BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attributes = Attributes::new();

    for attr in start.attributes() {
        let attr = attr.map_err(feed_error)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value().map_err(feed_error)?.into_owned();
        attributes.insert(&key, value);
    }

    Ok(Element {
        name,
        attributes,
        ..Default::default()
    })
}

fn attach(element: Element, stack: &mut [Element], root: &mut Option<Element>) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => {}
    }
}

/// Read the whole document into an element tree and return its root.
fn parse_document(text: &str) -> Result<Element> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event().map_err(feed_error)? {
            Event::Start(start) => stack.push(start_element(&start)?),
            Event::Empty(start) => {
                let element = start_element(&start)?;
                attach(element, &mut stack, &mut root);
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| feed_error("unexpected closing tag"))?;
                attach(element, &mut stack, &mut root);
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&t.unescape().map_err(feed_error)?);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(feed_error("document ended inside an open element"));
    }
    root.ok_or_else(|| feed_error("document has no root element"))
}

/// Reads XML feeds using a [`Registry`] of step and condition factories
#[derive(Debug, Clone)]
pub struct XmlFeedReader {
    registry: Registry,
}

impl Default for XmlFeedReader {
    fn default() -> Self {
        Self::new(Registry::with_defaults())
    }
}

impl XmlFeedReader {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    fn read_step(&self, element: &Element) -> Option<Step> {
        let Some(factory) = self.registry.step(&element.name) else {
            debug!(element = %element.name, "Skipping unknown task");
            return None;
        };

        let mut step = Step::new(factory(&element.attributes));

        let description = element
            .child("Description")
            .map(|d| d.text.trim().to_string())
            .filter(|d| !d.is_empty())
            .or_else(|| element.attributes.string("description"));
        if let Some(description) = description {
            step = step.with_description(description);
        }

        let conditions = element
            .child("Conditions")
            .and_then(|c| self.read_group(c).degrade());

        Some(step.with_conditions(conditions))
    }

    fn read_group(&self, element: &Element) -> ConditionGroup {
        let mut group = ConditionGroup::new();

        for child in &element.children {
            let combinator = Combinator::from_type(child.attributes.get("type"));

            let condition = if child.is("GroupCondition") || child.is("Conditions") || !child.children.is_empty() {
                self.read_group(child).degrade()
            } else if let Some(factory) = self.registry.condition(&child.name) {
                Some(Condition::Leaf(factory(&child.attributes)))
            } else {
                warn!(element = %child.name, "Skipping unknown condition");
                None
            };

            if let Some(condition) = condition {
                group.add(condition, combinator);
            }
        }

        group
    }
}

impl FeedReader for XmlFeedReader {
    #[instrument(skip_all)]
    fn read(&self, text: &str) -> Result<FeedDocument> {
        let root = parse_document(text)?;

        let base_url = root.attributes.string("BaseUrl");
        let tasks = if root.is("Tasks") {
            Some(&root)
        } else {
            root.child("Tasks")
        };

        let steps: Vec<Step> = tasks
            .map(|t| t.children.iter().filter_map(|c| self.read_step(c)).collect())
            .unwrap_or_default();

        debug!(
            root = %root.name,
            version = root.attributes.get("version").unwrap_or("-"),
            steps = steps.len(),
            "Feed read"
        );

        Ok(FeedDocument { base_url, steps })
    }
}
