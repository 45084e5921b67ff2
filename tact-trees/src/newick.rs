//! Newick reading and writing. The writer emits no rooting annotation.

use crate::tree::Tree;
use crate::TreeError;
use tact_common::Time;

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Self {
            input: s.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn advance(&mut self) {
        if self.pos < self.input.len() {
            self.pos += 1;
        }
    }

    /// Skip whitespace and bracketed comments.
    fn skip_ws(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r') => self.advance(),
                Some(b'[') => {
                    while let Some(c) = self.peek() {
                        self.advance();
                        if c == b']' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn expect(&mut self, c: u8) -> Result<(), TreeError> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.advance();
            Ok(())
        } else {
            Err(TreeError::Parse {
                pos: self.pos,
                msg: format!("expected '{}'", c as char),
            })
        }
    }

    /// Read a label up to the next structural character.
    fn read_label(&mut self) -> Option<String> {
        self.skip_ws();
        let quoted = self.peek() == Some(b'\'');
        if quoted {
            self.advance();
            let start = self.pos;
            while let Some(c) = self.peek() {
                if c == b'\'' {
                    break;
                }
                self.advance();
            }
            let label = std::str::from_utf8(&self.input[start..self.pos])
                .unwrap_or("")
                .to_string();
            self.advance();
            return Some(label);
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b'(' | b')' | b',' | b':' | b';' | b'[') {
                break;
            }
            self.advance();
        }
        let label = std::str::from_utf8(&self.input[start..self.pos])
            .unwrap_or("")
            .trim()
            .to_string();
        if label.is_empty() {
            None
        } else {
            Some(label)
        }
    }

    fn read_length(&mut self) -> Result<Option<Time>, TreeError> {
        self.skip_ws();
        if self.peek() != Some(b':') {
            return Ok(None);
        }
        self.advance();
        self.skip_ws();
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'0'..=b'9') | Some(b'.') | Some(b'e') | Some(b'E') | Some(b'+') | Some(b'-')
        ) {
            self.advance();
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|s| s.parse::<Time>().ok())
            .map(Some)
            .ok_or(TreeError::Parse {
                pos: start,
                msg: "malformed branch length".to_string(),
            })
    }
}

struct Builder {
    parents: Vec<Option<usize>>,
    lengths: Vec<Time>,
    labels: Vec<Option<String>>,
}

impl Builder {
    fn push(&mut self, parent: Option<usize>) -> usize {
        self.parents.push(parent);
        self.lengths.push(0.0);
        self.labels.push(None);
        self.parents.len() - 1
    }
}

fn parse_subtree(cur: &mut Cursor, b: &mut Builder, parent: Option<usize>) -> Result<usize, TreeError> {
    cur.skip_ws();
    let id = b.push(parent);
    if cur.peek() == Some(b'(') {
        cur.advance();
        loop {
            parse_subtree(cur, b, Some(id))?;
            cur.skip_ws();
            match cur.peek() {
                Some(b',') => cur.advance(),
                Some(b')') => {
                    cur.advance();
                    break;
                }
                _ => {
                    return Err(TreeError::Parse {
                        pos: cur.pos,
                        msg: "expected ',' or ')'".to_string(),
                    })
                }
            }
        }
    }
    b.labels[id] = cur.read_label();
    if let Some(len) = cur.read_length()? {
        b.lengths[id] = len;
    }
    Ok(id)
}

pub fn parse(text: &str) -> Result<Tree, TreeError> {
    let mut cur = Cursor::new(text);
    let mut b = Builder {
        parents: vec![],
        lengths: vec![],
        labels: vec![],
    };
    parse_subtree(&mut cur, &mut b, None)?;
    cur.expect(b';')?;
    Tree::from_parts(b.parents, b.lengths, b.labels)
}

fn format_length(len: Time) -> String {
    // Plain decimal keeps round-tripping lossless without scientific noise
    // for the magnitudes trees carry.
    let s = format!("{}", len);
    if s.contains('.') || s.contains('e') || s.contains('E') {
        s
    } else {
        format!("{}.0", s)
    }
}

fn write_node(tree: &Tree, n: crate::NodeId, out: &mut String, with_length: bool) {
    if !tree.is_leaf(n) {
        out.push('(');
        for (i, &c) in tree.children(n).iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_node(tree, c, out, true);
        }
        out.push(')');
    }
    if let Some(label) = tree.label(n) {
        out.push_str(label);
    }
    if with_length {
        out.push(':');
        out.push_str(&format_length(tree.length(n)));
    }
}

pub fn write(tree: &Tree) -> String {
    let mut out = String::new();
    write_node(tree, tree.root(), &mut out, false);
    out.push(';');
    out
}
