//! Tokenizer shared by both expression dialects.

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    /// `$name.property` or `${name.property}`, stored without the sigil or braces.
    Variable(String),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    Comma,
    /// `=`
    Assign,
    /// `==`
    Eq,
    /// `!=` or `<>`
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eof,
}

impl Token {
    /// Whether this is an identifier equal to `word`, ignoring ASCII case.
    pub fn is_word(&self, word: &str) -> bool {
        matches!(self, Token::Ident(s) if s.eq_ignore_ascii_case(word))
    }
}

pub struct Lexer {
    chars: Vec<char>,
    position: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            position: 0,
        }
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.position + 1).copied()
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn skip_whitespace(&mut self) {
        while self.current().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    /// Tokenize the whole input, ending with [`Token::Eof`].
    pub fn tokenize(mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            let Some(c) = self.current() else {
                tokens.push(Token::Eof);
                return Ok(tokens);
            };
            let token = match c {
                '(' => self.single(Token::LParen),
                ')' => self.single(Token::RParen),
                ',' => self.single(Token::Comma),
                '+' => self.single(Token::Plus),
                '-' => self.single(Token::Minus),
                '*' => self.single(Token::Star),
                '/' => self.single(Token::Slash),
                '%' => self.single(Token::Percent),
                '=' => self.either('=', Token::Eq, Token::Assign),
                '!' => self.either('=', Token::Ne, Token::Bang),
                '<' => {
                    if self.peek() == Some('>') {
                        self.advance();
                        self.single(Token::Ne)
                    } else {
                        self.either('=', Token::Le, Token::Lt)
                    }
                }
                '>' => self.either('=', Token::Ge, Token::Gt),
                '&' => self.pair('&', Token::AndAnd)?,
                '|' => self.pair('|', Token::OrOr)?,
                '\'' | '"' => self.string(c)?,
                '$' => self.variable()?,
                c if c.is_ascii_digit() => self.number()?,
                c if c.is_alphabetic() || c == '_' => Token::Ident(self.word()),
                other => return Err(format!("unexpected character '{other}'")),
            };
            tokens.push(token);
        }
    }

    fn single(&mut self, token: Token) -> Token {
        self.advance();
        token
    }

    fn either(&mut self, next: char, double: Token, single: Token) -> Token {
        self.advance();
        if self.current() == Some(next) {
            self.advance();
            double
        } else {
            single
        }
    }

    fn pair(&mut self, next: char, token: Token) -> Result<Token, String> {
        self.advance();
        if self.current() == Some(next) {
            self.advance();
            Ok(token)
        } else {
            Err(format!("expected '{next}{next}'"))
        }
    }

    fn word(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.current() {
            if c.is_alphanumeric() || c == '_' {
                out.push(c);
                self.advance();
            } else {
                break;
            }
        }
        out
    }

    fn number(&mut self) -> Result<Token, String> {
        let mut text = String::new();
        while let Some(c) = self.current() {
            let fractional = c == '.' && self.peek().is_some_and(|n| n.is_ascii_digit());
            if c.is_ascii_digit() || fractional {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| format!("invalid number '{text}'"))
    }

    fn string(&mut self, quote: char) -> Result<Token, String> {
        self.advance();
        let mut out = String::new();
        while let Some(c) = self.current() {
            self.advance();
            if c == quote {
                return Ok(Token::Str(out));
            }
            out.push(c);
        }
        Err("unterminated string literal".into())
    }

    fn variable(&mut self) -> Result<Token, String> {
        self.advance();
        let braced = self.current() == Some('{');
        if braced {
            self.advance();
        }
        let mut path = self.word();
        while self.current() == Some('.') && self.peek().is_some_and(|c| c.is_alphabetic() || c == '_') {
            self.advance();
            path.push('.');
            path.push_str(&self.word());
        }
        if braced {
            if self.current() != Some('}') {
                return Err("unterminated '${' reference".into());
            }
            self.advance();
        }
        if path.is_empty() {
            return Err("'$' must be followed by a variable name".into());
        }
        Ok(Token::Variable(path))
    }
}
