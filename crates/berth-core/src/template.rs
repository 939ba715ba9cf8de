//! Restricted template renderer for env files and proxy config.
//!
//! Supported syntax:
//!
//! - `{{ name }}` substitutes a context variable; unknown names are an error.
//! - `{% if EXPR %}`, `{% elif EXPR %}`, `{% else %}`, `{% endif %}` (nestable).
//! - `{# comment #}` is dropped.
//!
//! A `{% %}` or `{# #}` tag alone on its line also removes the line's
//! indentation and trailing newline. Rendering is pure: the same template and
//! context always produce the same bytes.

use crate::context::{is_valid_name, RenderContext};
use crate::error::TemplateError;
use crate::expr::Expr;

/// A parsed template, ready to render any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Var {
        name: String,
        line: usize,
    },
    If {
        branches: Vec<Branch>,
        otherwise: Option<Vec<Node>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Branch {
    cond: Expr,
    line: usize,
    body: Vec<Node>,
}

/// Parse and render in one step.
pub fn render(source: &str, ctx: &RenderContext) -> Result<String, TemplateError> {
    Template::parse(source)?.render(ctx)
}

impl Template {
    pub fn parse(source: &str) -> Result<Template, TemplateError> {
        let tokens = lex(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let (nodes, end) = parser.parse_block()?;
        if let Some((end, line)) = end {
            return Err(TemplateError::MalformedDirective {
                reason: format!("`{}` without matching `if`", end.keyword()),
                line,
            });
        }
        Ok(Template { nodes })
    }

    pub fn render(&self, ctx: &RenderContext) -> Result<String, TemplateError> {
        let mut out = String::new();
        render_nodes(&self.nodes, ctx, &mut out)?;
        Ok(out)
    }
}

fn render_nodes(
    nodes: &[Node],
    ctx: &RenderContext,
    out: &mut String,
) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var { name, line } => {
                let value = ctx
                    .get(name)
                    .ok_or_else(|| TemplateError::UnresolvedVariable {
                        name: name.clone(),
                        line: *line,
                    })?;
                out.push_str(value);
            }
            Node::If {
                branches,
                otherwise,
            } => {
                let mut taken = false;
                for branch in branches {
                    if branch.cond.eval(ctx, branch.line)? {
                        render_nodes(&branch.body, ctx, out)?;
                        taken = true;
                        break;
                    }
                }
                if !taken {
                    if let Some(body) = otherwise {
                        render_nodes(body, ctx, out)?;
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Var { body: String, line: usize },
    Tag { body: String, line: usize },
}

fn lex(src: &str) -> Result<Vec<Token>, TemplateError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut text_start = 0;
    let mut pos = 0;

    while pos + 1 < bytes.len() {
        if bytes[pos] != b'{' || !matches!(bytes[pos + 1], b'{' | b'%' | b'#') {
            pos += 1;
            continue;
        }

        let kind = bytes[pos + 1];
        let (open, close) = match kind {
            b'{' => ("{{", "}}"),
            b'%' => ("{%", "%}"),
            _ => ("{#", "#}"),
        };
        let line = line_at(src, pos);
        let body_start = pos + 2;
        let body_len = src[body_start..]
            .find(close)
            .ok_or(TemplateError::Unterminated { open, line })?;
        let body = &src[body_start..body_start + body_len];
        let mut end = body_start + body_len + 2;
        let mut text_end = pos;

        if kind != b'{' {
            if let Some((line_start, next)) = standalone_span(src, pos, end) {
                text_end = line_start.max(text_start);
                end = next;
            }
        }

        if text_end > text_start {
            tokens.push(Token::Text(src[text_start..text_end].to_string()));
        }
        match kind {
            b'{' => tokens.push(Token::Var {
                body: body.to_string(),
                line,
            }),
            b'%' => tokens.push(Token::Tag {
                body: body.to_string(),
                line,
            }),
            _ => {}
        }

        text_start = end;
        pos = end;
    }

    if text_start < src.len() {
        tokens.push(Token::Text(src[text_start..].to_string()));
    }
    Ok(tokens)
}

/// If the tag at `start..end` is alone on its line, return the line start and
/// the offset just past the line's newline.
fn standalone_span(src: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let blank = |s: &str| s.chars().all(|c| c == ' ' || c == '\t' || c == '\r');
    let line_start = src[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
    if !blank(&src[line_start..start]) {
        return None;
    }
    let (after, next) = match src[end..].find('\n') {
        Some(i) => (&src[end..end + i], end + i + 1),
        None => (&src[end..], src.len()),
    };
    if !blank(after) {
        return None;
    }
    Some((line_start, next))
}

fn line_at(src: &str, offset: usize) -> usize {
    src[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum BlockEnd {
    Elif(Expr),
    Else,
    Endif,
}

impl BlockEnd {
    fn keyword(&self) -> &'static str {
        match self {
            BlockEnd::Elif(_) => "elif",
            BlockEnd::Else => "else",
            BlockEnd::Endif => "endif",
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    /// Parse nodes until end of input or a block terminator (`elif`/`else`/`endif`).
    fn parse_block(&mut self) -> Result<(Vec<Node>, Option<(BlockEnd, usize)>), TemplateError> {
        let mut nodes = Vec::new();

        while let Some(token) = self.tokens.get(self.pos).cloned() {
            self.pos += 1;
            match token {
                Token::Text(text) => nodes.push(Node::Text(text)),
                Token::Var { body, line } => {
                    let name = body.trim();
                    if !is_valid_name(name) {
                        return Err(TemplateError::MalformedDirective {
                            reason: format!(
                                "expected a variable name inside `{{{{ }}}}`, got `{name}`"
                            ),
                            line,
                        });
                    }
                    nodes.push(Node::Var {
                        name: name.to_string(),
                        line,
                    });
                }
                Token::Tag { body, line } => {
                    let body = body.trim();
                    let (keyword, rest) = body
                        .split_once(char::is_whitespace)
                        .map(|(k, r)| (k, r.trim()))
                        .unwrap_or((body, ""));
                    match keyword {
                        "if" => {
                            let cond = parse_condition(rest, line)?;
                            nodes.push(self.parse_if(cond, line)?);
                        }
                        "elif" => {
                            let cond = parse_condition(rest, line)?;
                            return Ok((nodes, Some((BlockEnd::Elif(cond), line))));
                        }
                        "else" | "endif" => {
                            if !rest.is_empty() {
                                return Err(TemplateError::MalformedDirective {
                                    reason: format!("`{keyword}` takes no arguments"),
                                    line,
                                });
                            }
                            let end = if keyword == "else" {
                                BlockEnd::Else
                            } else {
                                BlockEnd::Endif
                            };
                            return Ok((nodes, Some((end, line))));
                        }
                        "" => {
                            return Err(TemplateError::MalformedDirective {
                                reason: "empty directive".to_string(),
                                line,
                            })
                        }
                        other => {
                            return Err(TemplateError::MalformedDirective {
                                reason: format!("unknown directive `{other}`"),
                                line,
                            })
                        }
                    }
                }
            }
        }

        Ok((nodes, None))
    }

    fn parse_if(&mut self, first: Expr, if_line: usize) -> Result<Node, TemplateError> {
        let mut branches = Vec::new();
        let mut cond = first;
        let mut cond_line = if_line;

        loop {
            let (body, end) = self.parse_block()?;
            match end {
                None => return Err(TemplateError::UnclosedBlock { line: if_line }),
                Some((BlockEnd::Elif(next), line)) => {
                    branches.push(Branch {
                        cond,
                        line: cond_line,
                        body,
                    });
                    cond = next;
                    cond_line = line;
                }
                Some((BlockEnd::Else, _)) => {
                    branches.push(Branch {
                        cond,
                        line: cond_line,
                        body,
                    });
                    let (otherwise, end) = self.parse_block()?;
                    return match end {
                        Some((BlockEnd::Endif, _)) => Ok(Node::If {
                            branches,
                            otherwise: Some(otherwise),
                        }),
                        None => Err(TemplateError::UnclosedBlock { line: if_line }),
                        Some((other, line)) => Err(TemplateError::MalformedDirective {
                            reason: format!("`{}` after `else`", other.keyword()),
                            line,
                        }),
                    };
                }
                Some((BlockEnd::Endif, _)) => {
                    branches.push(Branch {
                        cond,
                        line: cond_line,
                        body,
                    });
                    return Ok(Node::If {
                        branches,
                        otherwise: None,
                    });
                }
            }
        }
    }
}

fn parse_condition(src: &str, line: usize) -> Result<Expr, TemplateError> {
    if src.is_empty() {
        return Err(TemplateError::MalformedDirective {
            reason: "condition is missing".to_string(),
            line,
        });
    }
    Expr::parse(src).map_err(|e| TemplateError::MalformedDirective {
        reason: e.to_string(),
        line,
    })
}
