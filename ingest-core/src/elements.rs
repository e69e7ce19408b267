use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single node in an `$elements` DOM-path trail, as sent by autocapture.
/// Field names match the chain-string attribute keys they serialize under.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Element {
    pub tag_name: Option<String>,
    pub text: Option<String>,
    pub href: Option<String>,
    pub attr_id: Option<String>,
    #[serde(default)]
    pub attr_class: Vec<String>,
    pub nth_child: Option<u64>,
    pub nth_of_type: Option<u64>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// The result of extracting `$elements`: the ordered rows to persist (or mirror
/// to the log sink) plus the chain string attached to the canonical event.
#[derive(Debug, Clone)]
pub struct ExtractedElements {
    pub elements: Vec<Element>,
    pub chain: String,
    pub hash: String,
}

/// Normalizes a raw `$elements` array into an ordered chain string plus a
/// stable content hash. The chain is a pure function of the input list: two
/// calls with the same ordered elements produce the same chain and hash.
pub fn extract(raw: Vec<Element>) -> ExtractedElements {
    let chain = build_chain(&raw);
    let hash = hash_chain(&chain);
    ExtractedElements {
        elements: raw,
        chain,
        hash,
    }
}

fn build_chain(elements: &[Element]) -> String {
    elements
        .iter()
        .map(render_element)
        .collect::<Vec<_>>()
        .join(";")
}

fn render_element(el: &Element) -> String {
    let mut head = el.tag_name.clone().unwrap_or_default();
    for class in &el.attr_class {
        head.push('.');
        head.push_str(class);
    }

    let mut attrs = Vec::new();
    if let Some(href) = &el.href {
        attrs.push(format!("href=\"{}\"", escape(href)));
    }
    if let Some(text) = &el.text {
        attrs.push(format!("text=\"{}\"", escape(text)));
    }
    if let Some(attr_id) = &el.attr_id {
        attrs.push(format!("attr_id=\"{}\"", escape(attr_id)));
    }
    if let Some(nth_child) = el.nth_child {
        attrs.push(format!("nth-child=\"{nth_child}\""));
    }
    if let Some(nth_of_type) = el.nth_of_type {
        attrs.push(format!("nth-of-type=\"{nth_of_type}\""));
    }
    let mut extra: Vec<_> = el.attributes.iter().collect();
    extra.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in extra {
        attrs.push(format!("{key}=\"{}\"", escape(value)));
    }

    if attrs.is_empty() {
        head
    } else {
        format!("{head}:{}", attrs.join(":"))
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn hash_chain(chain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chain.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el(tag: &str) -> Element {
        Element {
            tag_name: Some(tag.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn chain_is_pure_function_of_input() {
        let elements = vec![el("div"), el("span")];
        let a = extract(elements.clone());
        let b = extract(elements);
        assert_eq!(a.chain, b.chain);
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn different_order_yields_different_chain() {
        let a = extract(vec![el("div"), el("span")]);
        let b = extract(vec![el("span"), el("div")]);
        assert_ne!(a.chain, b.chain);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn chain_includes_classes_and_attributes() {
        let element = Element {
            tag_name: Some("a".to_string()),
            attr_class: vec!["btn".to_string(), "primary".to_string()],
            href: Some("/signup".to_string()),
            nth_child: Some(2),
            ..Default::default()
        };
        let result = extract(vec![element]);
        assert_eq!(result.chain, "a.btn.primary:href=\"/signup\":nth-child=\"2\"");
    }

    #[test]
    fn empty_elements_yields_empty_chain() {
        let result = extract(vec![]);
        assert_eq!(result.chain, "");
    }

    #[test]
    fn quotes_in_text_are_escaped() {
        let element = Element {
            tag_name: Some("span".to_string()),
            text: Some("say \"hi\"".to_string()),
            ..Default::default()
        };
        let result = extract(vec![element]);
        assert_eq!(result.chain, "span:text=\"say \\\"hi\\\"\"");
    }
}
