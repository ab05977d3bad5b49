//! GBNF subset to regular expression.
//!
//! Supported: `name ::= ...` rules, `#` comments, `"..."` literals,
//! `[...]`/`[^...]` classes, `.`, `( )` groups, `* + ?` and rule references.
//! Rules are inlined into one expression rooted at `root`, so recursive rules
//! are rejected.
//!
//! Any rule that reaches itself again is out of scope, directly or through
//! other rules. That excludes nested data such as llama.cpp's `json.gbnf`
//! (`value` -> `object`/`array` -> `value`) and operator precedence such as
//! `arithmetic.gbnf` (`expr` -> `term` -> `factor` -> `"(" expr ")"`).
//! Flat repetition has to be spelled with `*`/`+` instead of a
//! self-referencing tail (`list ::= item ("," item)*`).

use std::collections::HashMap;

use kindle_core::{KindleError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(String),
    Class { negated: bool, items: Vec<(char, char)> },
    Any,
    Rule(String),
    Seq(Vec<Expr>),
    Alt(Vec<Expr>),
    Repeat(Box<Expr>, char),
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

fn parse_error(pos: usize, msg: impl std::fmt::Display) -> KindleError {
    KindleError::GrammarParse(format!("{msg} at byte {pos}"))
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// Skip whitespace (newlines included) and comments.
    fn skip_space(&mut self) {
        while let Some(c) = self.peek() {
            if c == '#' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn parse_name(&mut self) -> Result<String> {
        let start = self.pos;
        while self.peek().is_some_and(is_name_char) {
            self.bump();
        }
        if start == self.pos {
            return Err(parse_error(start, "expected rule name"));
        }
        Ok(self.src[start..self.pos].to_string())
    }

    /// Whether the upcoming tokens are `name ::=`, i.e. the start of a rule.
    fn at_rule_start(&self) -> bool {
        let mut probe = Parser {
            src: self.src,
            pos: self.pos,
        };
        if probe.parse_name().is_err() {
            return false;
        }
        probe.skip_space();
        probe.rest().starts_with("::=")
    }

    fn parse_rules(&mut self) -> Result<Vec<(String, Expr)>> {
        let mut rules = Vec::new();
        loop {
            self.skip_space();
            if self.peek().is_none() {
                break;
            }
            let name = self.parse_name()?;
            self.skip_space();
            if !self.rest().starts_with("::=") {
                return Err(parse_error(self.pos, "expected '::='"));
            }
            self.pos += 3;
            let body = self.parse_alternatives(false)?;
            rules.push((name, body));
        }
        Ok(rules)
    }

    fn parse_alternatives(&mut self, nested: bool) -> Result<Expr> {
        let mut alts = vec![self.parse_sequence(nested)?];
        loop {
            self.skip_space();
            if self.peek() != Some('|') {
                break;
            }
            self.bump();
            alts.push(self.parse_sequence(nested)?);
        }
        Ok(if alts.len() == 1 {
            alts.remove(0)
        } else {
            Expr::Alt(alts)
        })
    }

    fn parse_sequence(&mut self, nested: bool) -> Result<Expr> {
        let mut items = Vec::new();
        loop {
            self.skip_space();
            let item = match self.peek() {
                None | Some('|') => break,
                Some(')') if nested => break,
                Some(')') => return Err(parse_error(self.pos, "unbalanced ')'")),
                Some('"') => Expr::Literal(self.parse_literal()?),
                Some('[') => self.parse_class()?,
                Some('.') => {
                    self.bump();
                    Expr::Any
                }
                Some('(') => {
                    self.bump();
                    let inner = self.parse_alternatives(true)?;
                    self.skip_space();
                    if self.bump() != Some(')') {
                        return Err(parse_error(self.pos, "expected ')'"));
                    }
                    inner
                }
                Some(c) if is_name_char(c) => {
                    if !nested && self.at_rule_start() {
                        break;
                    }
                    Expr::Rule(self.parse_name()?)
                }
                Some(c) => return Err(parse_error(self.pos, format!("unexpected {c:?}"))),
            };
            let item = match self.peek() {
                Some(op @ ('*' | '+' | '?')) => {
                    self.bump();
                    Expr::Repeat(Box::new(item), op)
                }
                _ => item,
            };
            items.push(item);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Seq(items)
        })
    }

    fn parse_escape(&mut self) -> Result<char> {
        let pos = self.pos;
        match self.bump() {
            Some('n') => Ok('\n'),
            Some('t') => Ok('\t'),
            Some('r') => Ok('\r'),
            Some('x') => {
                let hex = self.rest().get(..2).ok_or_else(|| parse_error(pos, "short \\x escape"))?;
                let code = u32::from_str_radix(hex, 16)
                    .map_err(|_| parse_error(pos, format!("bad \\x escape {hex:?}")))?;
                self.pos += 2;
                char::from_u32(code).ok_or_else(|| parse_error(pos, "bad \\x escape"))
            }
            Some(c @ ('\\' | '"' | '[' | ']' | '-' | '^')) => Ok(c),
            Some(c) => Err(parse_error(pos, format!("unknown escape \\{c}"))),
            None => Err(parse_error(pos, "dangling escape")),
        }
    }

    fn parse_literal(&mut self) -> Result<String> {
        let start = self.pos;
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => out.push(self.parse_escape()?),
                Some(c) => out.push(c),
                None => return Err(parse_error(start, "unterminated string")),
            }
        }
    }

    fn parse_class(&mut self) -> Result<Expr> {
        let start = self.pos;
        self.bump();
        let negated = if self.peek() == Some('^') {
            self.bump();
            true
        } else {
            false
        };
        let mut items = Vec::new();
        loop {
            let lo = match self.bump() {
                Some(']') => break,
                Some('\\') => self.parse_escape()?,
                Some(c) => c,
                None => return Err(parse_error(start, "unterminated character class")),
            };
            let hi = if self.peek() == Some('-') && !self.rest().starts_with("-]") {
                self.bump();
                match self.bump() {
                    Some('\\') => self.parse_escape()?,
                    Some(c) => c,
                    None => return Err(parse_error(start, "unterminated character class")),
                }
            } else {
                lo
            };
            if hi < lo {
                return Err(parse_error(start, format!("inverted range {lo:?}-{hi:?}")));
            }
            items.push((lo, hi));
        }
        if items.is_empty() {
            return Err(parse_error(start, "empty character class"));
        }
        Ok(Expr::Class { negated, items })
    }
}

fn push_char(out: &mut String, c: char) {
    if c.is_ascii_alphanumeric() || c == ' ' {
        out.push(c);
    } else {
        out.push_str(&format!("\\x{{{:X}}}", c as u32));
    }
}

struct Inliner<'a> {
    rules: &'a HashMap<String, Expr>,
    stack: Vec<String>,
    cache: HashMap<String, String>,
}

impl Inliner<'_> {
    fn rule(&mut self, name: &str) -> Result<String> {
        if let Some(done) = self.cache.get(name) {
            return Ok(done.clone());
        }
        if self.stack.iter().any(|n| n == name) {
            return Err(KindleError::GrammarParse(format!(
                "recursive rule: {} -> {name}",
                self.stack.join(" -> ")
            )));
        }
        let body = self
            .rules
            .get(name)
            .ok_or_else(|| KindleError::GrammarParse(format!("undefined rule {name:?}")))?;
        self.stack.push(name.to_string());
        let mut out = String::new();
        self.emit(body, &mut out)?;
        self.stack.pop();
        self.cache.insert(name.to_string(), out.clone());
        Ok(out)
    }

    fn emit(&mut self, expr: &Expr, out: &mut String) -> Result<()> {
        match expr {
            Expr::Literal(s) => {
                out.push_str("(?:");
                for c in s.chars() {
                    push_char(out, c);
                }
                out.push(')');
            }
            Expr::Class { negated, items } => {
                out.push('[');
                if *negated {
                    out.push('^');
                }
                for &(lo, hi) in items {
                    push_char(out, lo);
                    if hi != lo {
                        out.push('-');
                        push_char(out, hi);
                    }
                }
                out.push(']');
            }
            Expr::Any => out.push_str("(?s:.)"),
            Expr::Rule(name) => {
                let body = self.rule(name)?;
                out.push_str("(?:");
                out.push_str(&body);
                out.push(')');
            }
            Expr::Seq(items) => {
                out.push_str("(?:");
                for item in items {
                    self.emit(item, out)?;
                }
                out.push(')');
            }
            Expr::Alt(alts) => {
                out.push_str("(?:");
                for (i, alt) in alts.iter().enumerate() {
                    if i > 0 {
                        out.push('|');
                    }
                    self.emit(alt, out)?;
                }
                out.push(')');
            }
            Expr::Repeat(inner, op) => {
                out.push_str("(?:");
                self.emit(inner, out)?;
                out.push(')');
                out.push(*op);
            }
        }
        Ok(())
    }
}

/// Translate a GBNF grammar into an equivalent regular expression.
pub fn gbnf_to_regex(src: &str) -> Result<String> {
    let parsed = Parser::new(src).parse_rules()?;
    let mut rules = HashMap::new();
    for (name, body) in parsed {
        if rules.insert(name.clone(), body).is_some() {
            return Err(KindleError::GrammarParse(format!("duplicate rule {name:?}")));
        }
    }
    if !rules.contains_key("root") {
        return Err(KindleError::GrammarParse("missing root rule".to_string()));
    }
    let mut inliner = Inliner {
        rules: &rules,
        stack: Vec::new(),
        cache: HashMap::new(),
    };
    inliner.rule("root")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_and_class() {
        let re = gbnf_to_regex(r#"root ::= "a" [0-9]+"#).unwrap();
        assert_eq!(re, "(?:(?:a)(?:[0-9])+)");
    }

    #[test]
    fn test_escapes_become_hex() {
        let re = gbnf_to_regex(r#"root ::= "\n." "#).unwrap();
        assert_eq!(re, "(?:\\x{A}\\x{2E})");
    }

    #[test]
    fn test_multiline_rules_and_comments() {
        let src = "# answer grammar\nroot ::= answer\nanswer ::= \"yes\"\n    | \"no\" # either\n";
        let re = gbnf_to_regex(src).unwrap();
        assert_eq!(re, "(?:(?:(?:yes)|(?:no)))");
    }

    #[test]
    fn test_recursion_rejected() {
        let err = gbnf_to_regex("root ::= \"(\" root \")\" | \"x\"").unwrap_err();
        assert!(err.to_string().contains("recursive"));
    }

    #[test]
    fn test_indirect_recursion_names_the_cycle() {
        let arithmetic = r#"
root   ::= expr
expr   ::= term ([-+] term)*
term   ::= factor ([*/] factor)*
factor ::= [0-9]+ | "(" expr ")"
"#;
        let err = gbnf_to_regex(arithmetic).unwrap_err();
        assert!(
            err.to_string().contains("expr -> term -> factor -> expr"),
            "{err}"
        );

        let nested = r#"
root  ::= value
value ::= array | "1"
array ::= "[" (value ("," value)*)? "]"
"#;
        assert!(matches!(
            gbnf_to_regex(nested),
            Err(KindleError::GrammarParse(_))
        ));
    }

    #[test]
    fn test_flat_list_with_repetition() {
        let list = r#"
root ::= "[" (item ("," item)*)? "]"
item ::= [0-9]+
"#;
        assert!(gbnf_to_regex(list).is_ok());
    }

    #[test]
    fn test_missing_root_and_undefined_rule() {
        assert!(gbnf_to_regex("start ::= \"a\"").is_err());
        assert!(gbnf_to_regex("root ::= other").is_err());
    }

    #[test]
    fn test_negated_class() {
        let re = gbnf_to_regex(r#"root ::= [^"\\]*"#).unwrap();
        assert_eq!(re, "(?:[^\\x{22}\\x{5C}])*");
    }
}
