//! Normalising pretty-printer for parsed signatures.
//!
//! `parse(print(sig))` yields a signature structurally equal to `sig`, which
//! is what makes staged signatures portable between installations.

use std::fmt::Write;

use crate::model::{NodeKind, Strategy};

use super::{NodeStub, ParsedSignature};

/// Renders a parsed signature back to canonical DSL text.
#[must_use]
pub fn print(sig: &ParsedSignature) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "name = {}", quote(&sig.name));
    let _ = writeln!(out, "component = {}", sig.component.as_str());
    if !sig.nodes.is_empty() {
        out.push('\n');
    }
    for node in &sig.nodes {
        print_node(&mut out, node);
    }
    out
}

fn print_node(out: &mut String, node: &NodeStub) {
    let kind = match node.kind {
        NodeKind::Module => "mod",
        NodeKind::EmbeddedSignature => "sig",
    };
    let mut attrs = Vec::new();
    if !node.module_parents.is_empty() {
        attrs.push(format!("mod: {}", node.module_parents.join(",")));
    }
    if !node.signature_parents.is_empty() {
        attrs.push(format!("sig: {}", node.signature_parents.join(",")));
    }
    if node.strategy != Strategy::Default {
        attrs.push(format!("strategy: {}", node.strategy.as_str()));
    }
    if let Some(args) = &node.args {
        attrs.push(format!("args: {}", quote(args)));
    }

    if attrs.is_empty() {
        let _ = writeln!(out, "{kind} {}", node.name);
    } else {
        let _ = writeln!(out, "{kind} {} ({})", node.name, attrs.join("; "));
    }
}

fn quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::super::parse;
    use super::*;

    #[test]
    fn test_roundtrip_simple() {
        let sig = parse("alpha", "mod a\nmod b (mod: a)\n").unwrap();
        let text = print(&sig);
        let reparsed = parse("other-default", &text).unwrap();
        assert_eq!(sig, reparsed);
    }

    #[test]
    fn test_roundtrip_full() {
        let source = r#"
component = identifier
mod probe (strategy: none)
mod banner (mod: probe; strategy: hold; args: "-p 80,443")
sig inner (mod: banner; sig: probe)
"#;
        let sig = parse("sweep", source).unwrap();
        let reparsed = parse("x", &print(&sig)).unwrap();
        assert_eq!(sig, reparsed);
        // And printing is a fixpoint.
        assert_eq!(print(&sig), print(&reparsed));
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("a\"b\\c"), r#""a\"b\\c""#);
        assert_eq!(quote("tab\there"), "\"tab\\there\"");
    }

    #[test]
    fn test_default_strategy_omitted() {
        let sig = parse("s", "mod a\n").unwrap();
        let text = print(&sig);
        assert!(!text.contains("strategy"));
    }
}
