//! Client request parsing.
//!
//! A request names the subset of a master record a client wants projected,
//! with per-field options:
//!
//! ```text
//! value[deadband=abs:1.0],power{voltage,current[array=0:2]},timeStamp
//! ```
//!
//! Grammar:
//!
//! ```text
//! request   := field-list | ε
//! field-list:= field (',' field)*
//! field     := path options? group?
//! path      := name ('.' name)*
//! options   := '[' name '=' value (',' name '=' value)* ']'
//! group     := '{' field-list '}'
//! ```
//!
//! A sub-structure named `_options` carries `name=value` entries that are
//! folded into its parent node's option map, equivalent to the `[...]`
//! form. The empty request selects the whole record.
//!
//! Parsing is a configuration step: any malformed input is rejected as a
//! whole with a positioned [`RequestError`] and no partial state.

mod options;

pub use options::{ArrayRange, Deadband, OptionError, PvOptions, TimestampMode};

use indexmap::IndexMap;

// ---------------------------------------------------------------------------
// RequestError
// ---------------------------------------------------------------------------

/// Parse error for the request grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// A character that cannot start or continue the expected token.
    #[error("unexpected character {ch:?} at position {pos}")]
    UnexpectedChar {
        /// Byte position in the request text.
        pos: usize,
        /// The offending character.
        ch: char,
    },
    /// The request ended inside an unfinished construct.
    #[error("unexpected end of request (unclosed {context})")]
    UnexpectedEnd {
        /// What was left unclosed (`'{{'`, `'['`, or a name).
        context: &'static str,
    },
    /// An empty field or option name.
    #[error("empty name at position {pos}")]
    EmptyName {
        /// Byte position in the request text.
        pos: usize,
    },
    /// `name=value` outside an `_options` group.
    #[error("assignment at position {pos} is only valid inside an _options group")]
    MisplacedAssignment {
        /// Byte position in the request text.
        pos: usize,
    },
    /// The same field was named twice at one level.
    #[error("duplicate field {name:?}")]
    DuplicateField {
        /// The duplicated name.
        name: String,
    },
}

// ---------------------------------------------------------------------------
// RequestNode / RequestSpec
// ---------------------------------------------------------------------------

/// One node of a parsed request: named children plus raw options.
///
/// Option values stay as strings here; the reserved set is given typed
/// form by [`PvOptions::parse`], and anything unrecognized is offered to
/// the projection compiler's custom-filter registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestNode {
    /// Named sub-field selections, in request order.
    pub children: IndexMap<String, RequestNode>,
    /// Raw `name=value` options attached to this node.
    pub options: IndexMap<String, String>,
}

impl RequestNode {
    /// Returns `true` if this node selects no sub-fields.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A parsed client request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSpec {
    /// Root selection node. An empty root selects the whole record.
    pub root: RequestNode,
}

impl RequestSpec {
    /// Parses the textual request grammar.
    ///
    /// # Errors
    ///
    /// Returns a [`RequestError`] describing the first offence; nothing is
    /// partially constructed.
    pub fn parse(text: &str) -> Result<Self, RequestError> {
        let mut parser = Parser {
            chars: text.char_indices().peekable(),
            text,
        };
        let root = parser.field_list(false)?;
        if let Some(&(pos, ch)) = parser.chars.peek() {
            return Err(RequestError::UnexpectedChar { pos, ch });
        }
        Ok(Self { root })
    }

    /// Returns `true` if the request selects the whole record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty() && self.root.options.is_empty()
    }

    /// Deterministic re-serialization: fields and options sorted by name.
    ///
    /// Two requests that select the same fields with the same options
    /// canonicalize identically regardless of source ordering, so this is
    /// the fan-out cache's sharing key.
    #[must_use]
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        if !self.root.options.is_empty() {
            let mut opts: Vec<(&String, &String)> = self.root.options.iter().collect();
            opts.sort();
            out.push_str("_options{");
            for (j, (k, v)) in opts.iter().enumerate() {
                if j > 0 {
                    out.push(',');
                }
                out.push_str(k);
                out.push('=');
                out.push_str(v);
            }
            out.push('}');
            if !self.root.children.is_empty() {
                out.push(',');
            }
        }
        write_node(&self.root, &mut out);
        out
    }
}

fn write_node(node: &RequestNode, out: &mut String) {
    let mut names: Vec<&String> = node.children.keys().collect();
    names.sort();
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(name);
        let child = &node.children[*name];
        if !child.options.is_empty() {
            let mut opts: Vec<(&String, &String)> = child.options.iter().collect();
            opts.sort();
            out.push('[');
            for (j, (k, v)) in opts.iter().enumerate() {
                if j > 0 {
                    out.push(',');
                }
                out.push_str(k);
                out.push('=');
                out.push_str(v);
            }
            out.push(']');
        }
        if !child.children.is_empty() {
            out.push('{');
            write_node(child, out);
            out.push('}');
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    text: &'a str,
}

impl Parser<'_> {
    /// Parses a comma-separated field list until end of input or `}`.
    ///
    /// `in_options` permits `name=value` entries (the `_options` group).
    fn field_list(&mut self, in_options: bool) -> Result<RequestNode, RequestError> {
        let mut node = RequestNode::default();
        loop {
            self.skip_ws();
            match self.chars.peek() {
                None => return Ok(node),
                Some(&(_, '}')) => return Ok(node),
                Some(&(_, ',')) => {
                    self.chars.next();
                    continue;
                }
                Some(_) => self.field(&mut node, in_options)?,
            }
        }
    }

    /// Parses one `path options? group?` entry into `parent`.
    fn field(&mut self, parent: &mut RequestNode, in_options: bool) -> Result<(), RequestError> {
        let name = self.name()?;
        self.skip_ws();

        // name=value entry (only inside _options)
        if let Some(&(pos, '=')) = self.chars.peek() {
            if !in_options {
                return Err(RequestError::MisplacedAssignment { pos });
            }
            self.chars.next();
            let value = self.option_value();
            parent.options.insert(name, value);
            return Ok(());
        }

        let mut node = RequestNode::default();

        if let Some(&(_, '[')) = self.chars.peek() {
            self.chars.next();
            self.bracket_options(&mut node)?;
            self.skip_ws();
        }

        if let Some(&(_, '{')) = self.chars.peek() {
            self.chars.next();
            let is_options_group = name == "_options";
            let body = self.field_list(is_options_group)?;
            match self.chars.next() {
                Some((_, '}')) => {}
                _ => return Err(RequestError::UnexpectedEnd { context: "'{'" }),
            }
            if is_options_group {
                // fold the group's assignments into the parent's options
                for (k, v) in body.options {
                    parent.options.insert(k, v);
                }
                return Ok(());
            }
            node.children = body.children;
            for (k, v) in body.options {
                node.options.insert(k, v);
            }
        } else if name == "_options" {
            return Err(RequestError::UnexpectedEnd { context: "_options" });
        }

        // dotted path segments become nested single-child nodes
        let mut dest = parent;
        let mut segments = name.split('.').peekable();
        while let Some(seg) = segments.next() {
            if seg.is_empty() {
                return Err(RequestError::EmptyName { pos: self.pos() });
            }
            let last = segments.peek().is_none();
            if last {
                if dest.children.contains_key(seg) {
                    return Err(RequestError::DuplicateField {
                        name: seg.to_string(),
                    });
                }
                dest.children.insert(seg.to_string(), node);
                return Ok(());
            }
            dest = match dest.children.entry(seg.to_string()) {
                indexmap::map::Entry::Occupied(entry) => {
                    let existing = entry.into_mut();
                    if existing.children.is_empty() {
                        // `seg` was already selected as a whole subtree;
                        // descending would silently narrow that selection
                        return Err(RequestError::DuplicateField {
                            name: seg.to_string(),
                        });
                    }
                    existing
                }
                indexmap::map::Entry::Vacant(entry) => entry.insert(RequestNode::default()),
            };
        }
        unreachable!("split never yields zero segments");
    }

    /// Parses `name=value (',' name=value)* ']'`.
    fn bracket_options(&mut self, node: &mut RequestNode) -> Result<(), RequestError> {
        loop {
            self.skip_ws();
            let name = self.name()?;
            self.skip_ws();
            match self.chars.next() {
                Some((_, '=')) => {}
                Some((pos, ch)) => return Err(RequestError::UnexpectedChar { pos, ch }),
                None => return Err(RequestError::UnexpectedEnd { context: "'['" }),
            }
            let value = self.option_value();
            node.options.insert(name, value);
            self.skip_ws();
            match self.chars.next() {
                Some((_, ',')) => {}
                Some((_, ']')) => return Ok(()),
                Some((pos, ch)) => return Err(RequestError::UnexpectedChar { pos, ch }),
                None => return Err(RequestError::UnexpectedEnd { context: "'['" }),
            }
        }
    }

    /// Parses a field/option name: `[A-Za-z0-9_.]+`.
    fn name(&mut self) -> Result<String, RequestError> {
        let mut out = String::new();
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
                out.push(ch);
                self.chars.next();
            } else {
                break;
            }
        }
        if out.is_empty() {
            match self.chars.peek() {
                Some(&(pos, ch)) => Err(RequestError::UnexpectedChar { pos, ch }),
                None => Err(RequestError::UnexpectedEnd { context: "name" }),
            }
        } else {
            Ok(out)
        }
    }

    /// Consumes an option value: anything up to `,`, `]`, `}` or end.
    /// Values may contain `:` (deadband and array ranges).
    fn option_value(&mut self) -> String {
        let mut out = String::new();
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch == ',' || ch == ']' || ch == '}' {
                break;
            }
            out.push(ch);
            self.chars.next();
        }
        out.trim().to_string()
    }

    fn skip_ws(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }
    }

    fn pos(&mut self) -> usize {
        self.chars.peek().map_or(self.text.len(), |&(pos, _)| pos)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
