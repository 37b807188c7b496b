//! Specification document intake.
//!
//! A specification document is parsed once into an owned [`Element`] tree and
//! registered by its root tag in a [`DocumentStorage`]. Parsing runs inside a
//! process-wide critical section; the resulting tree is immutable and safe to
//! share for reads.

use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Serializes every document load in the process.
static LOAD_LOCK: Mutex<()> = Mutex::new(());

/// Errors raised while loading a specification document.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// The text is not a well-formed document
    #[error("Malformed specification document: {0}")]
    Malformed(#[from] roxmltree::Error),

    /// A root with the same tag is already registered
    #[error("Root element <{0}> is already registered")]
    DuplicateRoot(String),
}

/// One element of a parsed specification document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    /// Tag name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of the named attribute, if present.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    /// Child elements with the given tag, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First child element with the given tag.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Concatenated, trimmed text content directly under this element.
    pub fn text(&self) -> &str {
        &self.text
    }

    fn from_node(node: roxmltree::Node<'_, '_>) -> Self {
        let attributes = node
            .attributes()
            .map(|a| (a.name().to_string(), a.value().to_string()))
            .collect();

        let children = node
            .children()
            .filter(|c| c.is_element())
            .map(Element::from_node)
            .collect();

        let text = node
            .children()
            .filter(|c| c.is_text())
            .filter_map(|c| c.text())
            .collect::<String>()
            .trim()
            .to_string();

        Element {
            name: node.tag_name().name().to_string(),
            attributes,
            children,
            text,
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.name)?;
        for (k, v) in &self.attributes {
            write!(f, " {}=\"{}\"", k, v)?;
        }
        write!(f, ">")
    }
}

/// Parsed documents, indexed by root tag.
#[derive(Debug, Clone, Default)]
pub struct DocumentStorage {
    roots: Vec<Element>,
}

impl DocumentStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `text` and register its root element in a fresh storage.
    pub fn from_text(text: &str) -> Result<Self, DocumentError> {
        let mut storage = Self::new();
        storage.parse_document(text)?;
        Ok(storage)
    }

    /// Parse `text` and register its root element.
    ///
    /// Only the parse itself runs under the process-wide load lock.
    pub fn parse_document(&mut self, text: &str) -> Result<&Element, DocumentError> {
        let root = {
            let _guard = LOAD_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
            let doc = roxmltree::Document::parse(text)?;
            Element::from_node(doc.root_element())
        };
        log::debug!("Loaded specification document with root {}", root);
        self.register_root(root)
    }

    /// Register an already-built root element under its tag.
    pub fn register_root(&mut self, root: Element) -> Result<&Element, DocumentError> {
        if self.root(root.name()).is_some() {
            return Err(DocumentError::DuplicateRoot(root.name));
        }
        self.roots.push(root);
        Ok(&self.roots[self.roots.len() - 1])
    }

    /// The registered root with the given tag.
    pub fn root(&self, tag: &str) -> Option<&Element> {
        self.roots.iter().find(|r| r.name == tag)
    }

    pub fn roots(&self) -> &[Element] {
        &self.roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
        <processor name="toy" endian="big">
            <spaces default="ram">
                <space name="ram" kind="processor" size="2"/>
            </spaces>
            <table name="gpr" registers="r0 r1">
                trailing text
            </table>
        </processor>
    "#;

    #[test]
    fn test_parse_and_register() {
        let storage = DocumentStorage::from_text(DOC).unwrap();
        let root = storage.root("processor").unwrap();

        assert_eq!(root.attribute("name"), Some("toy"));
        assert_eq!(root.children().len(), 2);

        let space = root.child("spaces").unwrap().children_named("space").next().unwrap();
        assert_eq!(space.attribute("size"), Some("2"));
        assert_eq!(root.child("table").unwrap().text(), "trailing text");
    }

    #[test]
    fn test_malformed_document() {
        let err = DocumentStorage::from_text("<processor><spaces></processor>").unwrap_err();
        assert!(matches!(err, DocumentError::Malformed(_)));
    }

    #[test]
    fn test_duplicate_root_rejected() {
        let mut storage = DocumentStorage::from_text(DOC).unwrap();
        let err = storage.parse_document(DOC).unwrap_err();
        assert!(matches!(err, DocumentError::DuplicateRoot(ref tag) if tag == "processor"));
    }

    #[test]
    fn test_display_element() {
        let storage = DocumentStorage::from_text(r#"<spec a="1"/>"#).unwrap();
        assert_eq!(storage.root("spec").unwrap().to_string(), r#"<spec a="1">"#);
    }
}
