//! grub2 script tree (§4.5, §9): a tagged `Statement` variant replacing the
//! source's string-typed command dispatch.

use super::scanner::{Token, Word};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Simple(Vec<Word>),
    If(Vec<Word>, Vec<Statement>, Vec<Statement>),
    For(String, Vec<Word>, Vec<Statement>),
    Function(String, Vec<Statement>),
    Menuentry(Vec<Word>, Vec<Statement>),
    Block(Vec<Statement>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn word_text(word: &Word) -> String {
        word.iter()
            .map(|p| match p {
                super::scanner::WordPart::Literal(s) => s.clone(),
                super::scanner::WordPart::Var { name, .. } => format!("${name}"),
            })
            .collect()
    }

    /// Collect consecutive `Token::Word`s up to (not including) the next
    /// `Semi`/`LBrace`/`RBrace`, or end of input.
    fn collect_argv(&mut self) -> Vec<Word> {
        let mut argv = Vec::new();
        while let Some(Token::Word(w)) = self.peek() {
            argv.push(w.clone());
            self.pos += 1;
        }
        argv
    }

    /// Parse statements until a `RBrace` (consumed) or end of input.
    fn parse_block(&mut self) -> Vec<Statement> {
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                None | Some(Token::RBrace) => {
                    if matches!(self.peek(), Some(Token::RBrace)) {
                        self.pos += 1;
                    }
                    break;
                }
                Some(Token::Semi) => {
                    self.pos += 1;
                }
                _ => {
                    if let Some(stmt) = self.parse_statement() {
                        stmts.push(stmt);
                    }
                }
            }
        }
        stmts
    }

    fn parse_statement(&mut self) -> Option<Statement> {
        let argv = self.collect_argv();
        if argv.is_empty() {
            // a bare brace-block with no leading keyword
            if matches!(self.peek(), Some(Token::LBrace)) {
                self.pos += 1;
                return Some(Statement::Block(self.parse_block()));
            }
            self.pos += 1;
            return None;
        }
        let head = Self::word_text(&argv[0]);
        match head.as_str() {
            "menuentry" => {
                let rest = argv[1..].to_vec();
                if matches!(self.peek(), Some(Token::LBrace)) {
                    self.pos += 1;
                    let body = self.parse_block();
                    Some(Statement::Menuentry(rest, body))
                } else {
                    Some(Statement::Menuentry(rest, Vec::new()))
                }
            }
            "function" => {
                let name = argv.get(1).map(Self::word_text).unwrap_or_default();
                if matches!(self.peek(), Some(Token::LBrace)) {
                    self.pos += 1;
                    let body = self.parse_block();
                    Some(Statement::Function(name, body))
                } else {
                    Some(Statement::Function(name, Vec::new()))
                }
            }
            "if" => {
                let cond = argv[1..].to_vec();
                if matches!(self.peek(), Some(Token::LBrace)) {
                    self.pos += 1;
                    let then_body = self.parse_block();
                    Some(Statement::If(cond, then_body, Vec::new()))
                } else {
                    Some(Statement::If(cond, Vec::new(), Vec::new()))
                }
            }
            "for" => {
                // `for VAR in a b c { ... }` (a block-based simplification
                // of the text-form `for/in ... do ... done`).
                let var = argv.get(1).map(Self::word_text).unwrap_or_default();
                let list = argv.get(3..).map(|s| s.to_vec()).unwrap_or_default();
                if matches!(self.peek(), Some(Token::LBrace)) {
                    self.pos += 1;
                    let body = self.parse_block();
                    Some(Statement::For(var, list, body))
                } else {
                    Some(Statement::For(var, list, Vec::new()))
                }
            }
            _ => {
                if matches!(self.peek(), Some(Token::LBrace)) {
                    // a command immediately followed by a brace block is
                    // treated as a bare nested block after the command.
                    self.pos += 1;
                    let mut stmts = vec![Statement::Simple(argv)];
                    stmts.extend(self.parse_block());
                    Some(Statement::Block(stmts))
                } else {
                    Some(Statement::Simple(argv))
                }
            }
        }
    }
}

pub fn parse(text: &str) -> Vec<Statement> {
    let tokens = super::scanner::scan(text);
    let mut p = Parser { tokens, pos: 0 };
    p.parse_block()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_menuentry_with_simple_commands() {
        let stmts = parse("menuentry 'X' { set root=(uuid=BBB); linux /vm ; initrd /ird }");
        assert_eq!(stmts.len(), 1);
        match &stmts[0] {
            Statement::Menuentry(argv, body) => {
                assert_eq!(Parser::word_text(&argv[0]), "X");
                assert_eq!(body.len(), 3);
            }
            other => panic!("expected menuentry, got {other:?}"),
        }
    }
}
