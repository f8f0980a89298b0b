//! A compact markup for writing documents and selections in tests.
//!
//! ```text
//! <paragraph>foo[<$text bold="true">bar</$text>]baz<image></image></paragraph>
//! ```
//!
//! Element tags name node kinds, `<$text ...>` wraps text carrying
//! attributes, `[` and `]` mark the selection and `[]` a caret. Attribute
//! values are read as JSON when they parse as JSON, as strings otherwise.

use std::fmt::Write as _;

use serde_json::Value;
use thiserror::Error;

use crate::core::{Attrs, Document, ElementNode, Node, Point, Range, Selection, TextNode};
use crate::schema::Schema;

const TEXT_TAG: &str = "$text";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MarkupError {
    #[error("unexpected end of markup")]
    UnexpectedEnd,
    #[error("closing tag </{found}> does not match <{expected}>")]
    MismatchedClose { expected: String, found: String },
    #[error("malformed tag at byte {0}")]
    MalformedTag(usize),
    #[error("text or selection marker outside a text block at byte {0}")]
    OutsideTextBlock(usize),
    #[error("selection markers are unbalanced")]
    UnbalancedMarkers,
}

struct Frame {
    kind: String,
    attrs: Attrs,
    children: Vec<Node>,
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    schema: &'a Schema,
    stack: Vec<Frame>,
    roots: Vec<Node>,
    text_attrs: Option<Attrs>,
    start: Option<Point>,
    end: Option<Point>,
}

/// Parses markup into a document and the selection it marks. Without
/// markers the selection is a caret at the start of the first text block.
pub fn parse(markup: &str, schema: &Schema) -> Result<(Document, Selection), MarkupError> {
    let mut parser = Parser {
        src: markup,
        pos: 0,
        schema,
        stack: Vec::new(),
        roots: Vec::new(),
        text_attrs: None,
        start: None,
        end: None,
    };
    parser.run()?;

    let doc = Document {
        children: parser.roots,
    };
    let selection = match (parser.start, parser.end) {
        (Some(start), Some(end)) if start <= end => Selection::from_range(Range::new(start, end)),
        (None, None) => {
            let point = doc
                .text_blocks(schema)
                .first()
                .map(|b| Point::new(b.path.clone(), 0))
                .unwrap_or_else(|| Point::new(vec![0], 0));
            Selection::collapsed(point)
        }
        _ => return Err(MarkupError::UnbalancedMarkers),
    };
    Ok((doc, selection))
}

impl Parser<'_> {
    fn run(&mut self) -> Result<(), MarkupError> {
        while self.pos < self.src.len() {
            let rest = &self.src[self.pos..];
            if rest.starts_with("</") {
                self.close_tag()?;
            } else if rest.starts_with('<') {
                self.open_tag()?;
            } else if rest.starts_with('[') {
                let point = self.point()?;
                self.start = Some(point);
                self.pos += 1;
            } else if rest.starts_with(']') {
                let point = self.point()?;
                self.end = Some(point);
                self.pos += 1;
            } else {
                let len = rest.find(['<', '[', ']']).unwrap_or(rest.len());
                let text = &rest[..len];
                self.push_text(text)?;
                self.pos += len;
            }
        }

        if self.stack.is_empty() && self.text_attrs.is_none() {
            Ok(())
        } else {
            Err(MarkupError::UnexpectedEnd)
        }
    }

    fn block_path(&self) -> Vec<usize> {
        let mut path = Vec::with_capacity(self.stack.len());
        let mut siblings = self.roots.len();
        for frame in &self.stack {
            path.push(siblings);
            siblings = frame.children.len();
        }
        path
    }

    fn point(&self) -> Result<Point, MarkupError> {
        let Some(frame) = self.stack.last() else {
            return Err(MarkupError::OutsideTextBlock(self.pos));
        };
        if !self.is_text_frame(frame) {
            return Err(MarkupError::OutsideTextBlock(self.pos));
        }
        let offset = frame.children.iter().map(Node::inline_len).sum();
        Ok(Point::new(self.block_path(), offset))
    }

    fn is_text_frame(&self, frame: &Frame) -> bool {
        match self.schema.node_spec(&frame.kind) {
            Some(_) => self.schema.is_text_block(&ElementNode {
                kind: frame.kind.clone(),
                attrs: Attrs::default(),
                children: Vec::new(),
            }),
            None => true,
        }
    }

    fn push_text(&mut self, text: &str) -> Result<(), MarkupError> {
        if text.trim().is_empty() && self.text_attrs.is_none() {
            let in_text_block = self
                .stack
                .last()
                .is_some_and(|frame| self.is_text_frame(frame));
            if !in_text_block {
                return Ok(());
            }
        }
        let attrs = self.text_attrs.clone().unwrap_or_default();
        let pos = self.pos;
        let Some(frame) = self.stack.last_mut() else {
            return Err(MarkupError::OutsideTextBlock(pos));
        };
        if let Some(Node::Text(last)) = frame.children.last_mut() {
            if last.attrs == attrs {
                last.text.push_str(text);
                return Ok(());
            }
        }
        frame.children.push(Node::Text(TextNode {
            text: text.to_string(),
            attrs,
        }));
        Ok(())
    }

    fn tag_end(&self) -> Result<usize, MarkupError> {
        self.src[self.pos..]
            .find('>')
            .map(|ix| self.pos + ix)
            .ok_or(MarkupError::MalformedTag(self.pos))
    }

    fn open_tag(&mut self) -> Result<(), MarkupError> {
        let end = self.tag_end()?;
        let mut inner = &self.src[self.pos + 1..end];
        let self_closing = inner.ends_with('/');
        if self_closing {
            inner = &inner[..inner.len() - 1];
        }
        let (name, attrs) = parse_tag(inner).ok_or(MarkupError::MalformedTag(self.pos))?;
        self.pos = end + 1;

        if name == TEXT_TAG {
            if self.text_attrs.is_some() {
                return Err(MarkupError::MalformedTag(self.pos));
            }
            self.text_attrs = Some(attrs);
            return Ok(());
        }

        if self.schema.is_void(&name) {
            let node = Node::Void(crate::core::VoidNode {
                kind: name.clone(),
                attrs,
            });
            if !self_closing {
                let close = format!("</{name}>");
                if self.src[self.pos..].starts_with(&close) {
                    self.pos += close.len();
                }
            }
            self.push_node(node);
            return Ok(());
        }

        let frame = Frame {
            kind: name,
            attrs,
            children: Vec::new(),
        };
        if self_closing {
            self.push_node(Node::Element(frame.into_element()));
        } else {
            self.stack.push(frame);
        }
        Ok(())
    }

    fn close_tag(&mut self) -> Result<(), MarkupError> {
        let end = self.tag_end()?;
        let name = self.src[self.pos + 2..end].trim().to_string();
        self.pos = end + 1;

        if name == TEXT_TAG {
            return match self.text_attrs.take() {
                Some(_) => Ok(()),
                None => Err(MarkupError::MismatchedClose {
                    expected: String::new(),
                    found: name,
                }),
            };
        }

        let Some(frame) = self.stack.pop() else {
            return Err(MarkupError::MismatchedClose {
                expected: String::new(),
                found: name,
            });
        };
        if frame.kind != name {
            return Err(MarkupError::MismatchedClose {
                expected: frame.kind,
                found: name,
            });
        }
        self.push_node(Node::Element(frame.into_element()));
        Ok(())
    }

    fn push_node(&mut self, node: Node) {
        match self.stack.last_mut() {
            Some(frame) => frame.children.push(node),
            None => self.roots.push(node),
        }
    }
}

impl Frame {
    fn into_element(self) -> ElementNode {
        ElementNode {
            kind: self.kind,
            attrs: self.attrs,
            children: self.children,
        }
    }
}

fn parse_tag(inner: &str) -> Option<(String, Attrs)> {
    let inner = inner.trim();
    let name_end = inner.find(char::is_whitespace).unwrap_or(inner.len());
    let name = &inner[..name_end];
    if name.is_empty() {
        return None;
    }

    let mut attrs = Attrs::new();
    let mut rest = inner[name_end..].trim_start();
    while !rest.is_empty() {
        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        let after = rest[eq + 1..].trim_start().strip_prefix('"')?;
        let close = after.find('"')?;
        let raw = &after[..close];
        let value =
            serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        attrs.insert(key.to_string(), value);
        rest = after[close + 1..].trim_start();
    }
    Some((name.to_string(), attrs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Marker {
    End,
    Caret,
    Start,
}

impl Marker {
    fn as_str(self) -> &'static str {
        match self {
            Marker::End => "]",
            Marker::Caret => "[]",
            Marker::Start => "[",
        }
    }
}

/// Prints `doc` and `selection` back into markup. Markers at a leaf boundary
/// are written outside the `<$text>` tags.
pub fn stringify(doc: &Document, selection: &Selection, schema: &Schema) -> String {
    let mut markers: Vec<(Point, Marker)> = Vec::new();
    for range in &selection.ranges {
        if range.is_collapsed() {
            markers.push((range.start.clone(), Marker::Caret));
        } else {
            markers.push((range.start.clone(), Marker::Start));
            markers.push((range.end.clone(), Marker::End));
        }
    }
    markers.sort();

    let mut out = String::new();
    let mut path = Vec::new();
    write_nodes(&mut out, &doc.children, &mut path, &markers, schema);
    out
}

fn write_nodes(
    out: &mut String,
    nodes: &[Node],
    path: &mut Vec<usize>,
    markers: &[(Point, Marker)],
    schema: &Schema,
) {
    for (ix, node) in nodes.iter().enumerate() {
        path.push(ix);
        match node {
            Node::Element(el) => {
                write_open(out, &el.kind, &el.attrs);
                if schema.is_text_block(el) {
                    let here: Vec<(usize, Marker)> = markers
                        .iter()
                        .filter(|(point, _)| point.path == *path)
                        .map(|(point, marker)| (point.offset, *marker))
                        .collect();
                    write_inline(out, el, &here);
                } else {
                    write_nodes(out, &el.children, path, markers, schema);
                }
                let _ = write!(out, "</{}>", el.kind);
            }
            Node::Void(v) => {
                write_open(out, &v.kind, &v.attrs);
                let _ = write!(out, "</{}>", v.kind);
            }
            Node::Text(t) => out.push_str(&t.text),
        }
        path.pop();
    }
}

fn write_inline(out: &mut String, el: &ElementNode, markers: &[(usize, Marker)]) {
    let mut pending = markers.iter().peekable();

    for item in el.inline_items() {
        while let Some((_, marker)) = pending.next_if(|(offset, _)| *offset <= item.start) {
            out.push_str(marker.as_str());
        }

        match item.node {
            Node::Text(t) if t.text.is_empty() => {}
            Node::Text(t) => {
                let wrapped = !t.attrs.is_empty();
                if wrapped {
                    write_open(out, TEXT_TAG, &t.attrs);
                }
                let mut written = 0;
                while let Some((offset, marker)) = pending.next_if(|(offset, _)| *offset < item.end)
                {
                    let split = offset - item.start;
                    out.push_str(&t.text[written..split]);
                    out.push_str(marker.as_str());
                    written = split;
                }
                out.push_str(&t.text[written..]);
                if wrapped {
                    let _ = write!(out, "</{TEXT_TAG}>");
                }
            }
            Node::Void(v) => {
                write_open(out, &v.kind, &v.attrs);
                let _ = write!(out, "</{}>", v.kind);
            }
            Node::Element(_) => {}
        }
    }

    for (_, marker) in pending {
        out.push_str(marker.as_str());
    }
}

fn write_open(out: &mut String, name: &str, attrs: &Attrs) {
    out.push('<');
    out.push_str(name);
    for (key, value) in attrs {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let _ = write!(out, " {key}=\"{value}\"");
    }
    out.push('>');
}
