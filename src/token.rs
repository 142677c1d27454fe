/// The kind of a lexical token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// A command word (program name, argument or redirection target).
    Word,
    /// A redirection operator: `<`, `>`, `>>`, `2>` or `2>>`.
    Redirect,
    /// `;`
    Sequence,
    /// `&`
    Background,
    /// `|`
    Pipe,
    /// `&&`
    And,
    /// `||`
    Or,
    /// `(`
    LParen,
    /// `)`
    RParen,
}

/// A token scanned from a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Token {
            kind,
            text: text.into(),
        }
    }
}

fn is_special(c: char) -> bool {
    matches!(c, '<' | '>' | '|' | '&' | ';' | '(' | ')')
}

/// Scans the next token from `input`.
///
/// Returns the token together with the unscanned remainder of the input, or
/// `None` once only whitespace is left. Quotes (single or double) group
/// characters into one word and a backslash escapes the following character.
/// A `2` immediately followed by `>` starts a stderr redirection.
pub fn next_token(input: &str) -> Option<(Token, &str)> {
    let input = input.trim_start();
    let mut chars = input.char_indices().peekable();
    let (_, ch) = chars.next()?;

    let two = |s: &str| input.starts_with(s);
    let op = match ch {
        ';' => Some(Token::new(TokenKind::Sequence, ";")),
        '(' => Some(Token::new(TokenKind::LParen, "(")),
        ')' => Some(Token::new(TokenKind::RParen, ")")),
        '&' if two("&&") => Some(Token::new(TokenKind::And, "&&")),
        '&' => Some(Token::new(TokenKind::Background, "&")),
        '|' if two("||") => Some(Token::new(TokenKind::Or, "||")),
        '|' => Some(Token::new(TokenKind::Pipe, "|")),
        '<' => Some(Token::new(TokenKind::Redirect, "<")),
        '>' if two(">>") => Some(Token::new(TokenKind::Redirect, ">>")),
        '>' => Some(Token::new(TokenKind::Redirect, ">")),
        '2' if two("2>>") => Some(Token::new(TokenKind::Redirect, "2>>")),
        '2' if two("2>") => Some(Token::new(TokenKind::Redirect, "2>")),
        _ => None,
    };
    if let Some(token) = op {
        let rest = &input[token.text.len()..];
        return Some((token, rest));
    }

    // Normal word, possibly with quoted sections.
    let mut word = String::new();
    let mut end = input.len();
    let mut quote: Option<char> = None;
    let mut pending = Some((0, ch));
    while let Some((idx, c)) = pending.take().or_else(|| chars.next()) {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => word.push(c),
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    word.push(escaped);
                }
            }
            None if c.is_whitespace() || is_special(c) => {
                end = idx;
                break;
            }
            None => word.push(c),
        }
    }
    Some((Token::new(TokenKind::Word, word), &input[end..]))
}

/// Lazily scans a line, one token per call to `next`.
pub struct Tokens<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        let (token, rest) = next_token(self.rest)?;
        self.rest = rest;
        Some(token)
    }
}

/// Returns an iterator over the tokens of `line`.
pub fn tokens(line: &str) -> Tokens<'_> {
    Tokens { rest: line }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokens(input).map(|t| t.kind).collect()
    }

    fn texts(input: &str) -> Vec<String> {
        tokens(input).map(|t| t.text).collect()
    }

    #[test]
    fn test_tokenize_simple() {
        assert_eq!(texts("ls -l"), vec!["ls", "-l"]);
        assert_eq!(kinds("ls -l"), vec![TokenKind::Word, TokenKind::Word]);
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(texts("echo \"hello world\""), vec!["echo", "hello world"]);
        assert_eq!(texts("echo 'a;b' x"), vec!["echo", "a;b", "x"]);
        assert_eq!(texts("echo pre\"mid dle\"post"), vec!["echo", "premid dlepost"]);
    }

    #[test]
    fn test_tokenize_escape() {
        assert_eq!(texts(r"echo a\ b \&"), vec!["echo", "a b", "&"]);
        assert_eq!(kinds(r"echo \&"), vec![TokenKind::Word, TokenKind::Word]);
    }

    #[test]
    fn test_tokenize_operators_without_spaces() {
        assert_eq!(
            kinds("a&&b||c|d;e&"),
            vec![
                TokenKind::Word,
                TokenKind::And,
                TokenKind::Word,
                TokenKind::Or,
                TokenKind::Word,
                TokenKind::Pipe,
                TokenKind::Word,
                TokenKind::Sequence,
                TokenKind::Word,
                TokenKind::Background,
            ]
        );
    }

    #[test]
    fn test_tokenize_redirections() {
        let toks: Vec<Token> = tokens("cat <in >>out 2>err 2>>log >x").collect();
        let ops: Vec<&str> = toks
            .iter()
            .filter(|t| t.kind == TokenKind::Redirect)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(ops, vec!["<", ">>", "2>", "2>>", ">"]);
        assert_eq!(toks[2].text, "in");
    }

    #[test]
    fn test_two_is_a_word_unless_followed_by_gt() {
        assert_eq!(texts("head -n 2 file"), vec!["head", "-n", "2", "file"]);
        assert_eq!(kinds("echo 2>f")[1], TokenKind::Redirect);
    }

    #[test]
    fn test_next_token_returns_rest() {
        let (tok, rest) = next_token("  echo hi").unwrap();
        assert_eq!(tok, Token::new(TokenKind::Word, "echo"));
        assert_eq!(rest, " hi");
        assert!(next_token("   \n").is_none());
    }
}
