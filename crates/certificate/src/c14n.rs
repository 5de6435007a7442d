//! Inclusive Canonical XML 1.0 without comments, over a parsed `roxmltree` document.

use roxmltree::{Node, NodeId, NodeType};

/// Canonical form of the whole document. `skip` removes one element subtree
/// (the enveloped signature).
pub fn canonicalize_document(doc: &roxmltree::Document, skip: Option<NodeId>) -> String {
    let mut out = String::new();
    let mut seen_root = false;

    for child in doc.root().children() {
        match child.node_type() {
            NodeType::Element => {
                write_element(child, &[], skip, &mut out);
                seen_root = true;
            }
            NodeType::PI => {
                if seen_root {
                    out.push('\n');
                }
                write_pi(child, &mut out);
                if !seen_root {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
    out
}

/// Canonical form of one element treated as a document subset apex: every namespace in
/// scope is rendered on it.
pub fn canonicalize_subtree(node: Node, skip: Option<NodeId>) -> String {
    let mut out = String::new();
    write_element(node, &[], skip, &mut out);
    out
}

type NsBinding<'a> = (Option<&'a str>, &'a str);

fn in_scope<'a>(node: Node<'a, '_>) -> Vec<NsBinding<'a>> {
    let mut bindings: Vec<NsBinding<'a>> = node
        .namespaces()
        .filter(|ns| ns.name() != Some("xml"))
        .map(|ns| (ns.name(), ns.uri()))
        .collect();
    // default namespace first, then prefixes in lexical order
    bindings.sort_by(|a, b| a.0.cmp(&b.0));
    bindings.dedup_by(|a, b| a.0 == b.0);
    bindings
}

fn qualified_name(node: Node, namespace: Option<&str>, local: &str) -> String {
    match namespace.and_then(|uri| node.lookup_prefix(uri)) {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}:{local}"),
        _ => local.to_string(),
    }
}

fn write_element(node: Node, rendered: &[NsBinding], skip: Option<NodeId>, out: &mut String) {
    if Some(node.id()) == skip {
        return;
    }

    let tag = node.tag_name();
    let name = qualified_name(node, tag.namespace(), tag.name());
    let scope = in_scope(node);

    out.push('<');
    out.push_str(&name);

    for (prefix, uri) in &scope {
        if prefix.is_none() && uri.is_empty() {
            continue;
        }
        if rendered.iter().any(|(p, u)| p == prefix && u == uri) {
            continue;
        }
        match prefix {
            None => out.push_str(" xmlns=\""),
            Some(p) => {
                out.push_str(" xmlns:");
                out.push_str(p);
                out.push_str("=\"");
            }
        }
        escape_attr(uri, out);
        out.push('"');
    }
    let parent_default = rendered.iter().any(|(p, u)| p.is_none() && !u.is_empty());
    let own_default = scope.iter().any(|(p, u)| p.is_none() && !u.is_empty());
    if parent_default && !own_default {
        out.push_str(" xmlns=\"\"");
    }

    let mut attrs: Vec<(&str, &str, String, &str)> = node
        .attributes()
        .map(|a| {
            let ns = a.namespace().unwrap_or("");
            let qname = qualified_name(node, a.namespace(), a.name());
            (ns, a.name(), qname, a.value())
        })
        .collect();
    attrs.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    for (_, _, qname, value) in attrs {
        out.push(' ');
        out.push_str(&qname);
        out.push_str("=\"");
        escape_attr(value, out);
        out.push('"');
    }
    out.push('>');

    for child in node.children() {
        match child.node_type() {
            NodeType::Element => write_element(child, &scope, skip, out),
            NodeType::Text => escape_text(child.text().unwrap_or_default(), out),
            NodeType::PI => write_pi(child, out),
            _ => {}
        }
    }

    out.push_str("</");
    out.push_str(&name);
    out.push('>');
}

fn write_pi(node: Node, out: &mut String) {
    if let Some(pi) = node.pi() {
        out.push_str("<?");
        out.push_str(pi.target);
        if let Some(value) = pi.value {
            if !value.is_empty() {
                out.push(' ');
                out.push_str(value);
            }
        }
        out.push_str("?>");
    }
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}
