use crate::error::ParseError;
use crate::token::{Token, TokenKind};
use nix::unistd::Pid;
use std::fmt;

/// Which standard stream a redirection rebinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

/// How a redirection target is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Truncate,
    Append,
}

/// A single `<`, `>`, `>>`, `2>` or `2>>` redirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub stream: Stream,
    pub mode: Mode,
    pub target: String,
}

impl Redirection {
    fn from_operator(op: &str, target: String) -> Self {
        let (stream, mode) = match op {
            "<" => (Stream::Stdin, Mode::Read),
            ">>" => (Stream::Stdout, Mode::Append),
            "2>" => (Stream::Stderr, Mode::Truncate),
            "2>>" => (Stream::Stderr, Mode::Append),
            _ => (Stream::Stdout, Mode::Truncate),
        };
        Redirection {
            stream,
            mode,
            target,
        }
    }
}

/// Position of a stage within its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    None,
    /// Last stage: stdin comes from the previous stage.
    ReadsPrevious,
    /// First stage: stdout goes to the next stage.
    WritesNext,
    /// Interior stage.
    Both,
}

impl PipeRole {
    pub fn reads(self) -> bool {
        matches!(self, PipeRole::ReadsPrevious | PipeRole::Both)
    }

    pub fn writes(self) -> bool {
        matches!(self, PipeRole::WritesNext | PipeRole::Both)
    }
}

/// One command of a pipeline.
#[derive(Debug)]
pub struct Stage {
    /// Program name followed by its arguments.
    pub argv: Vec<String>,
    pub redirections: Vec<Redirection>,
    pub pipe_role: PipeRole,
    /// Set by the executor once the stage's process has been forked.
    pub pid: Option<Pid>,
}

impl Stage {
    fn new() -> Self {
        Stage {
            argv: Vec::new(),
            redirections: Vec::new(),
            pipe_role: PipeRole::None,
            pid: None,
        }
    }

    /// The program name, if the stage has any words.
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// The operator that ends a pipeline and decides how the next one is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    /// `;`
    Sequence,
    /// `&`
    Background,
    /// `&&`
    And,
    /// `||`
    Or,
    /// End of the line without an operator.
    End,
}

impl Join {
    /// Whether the pipeline following one ended by `self` runs, given the
    /// last exit status.
    pub fn admits(self, last_status: i32) -> bool {
        match self {
            Join::And => last_status == 0,
            Join::Or => last_status != 0,
            Join::Sequence | Join::Background | Join::End => true,
        }
    }
}

/// Stages connected by pipes, all run in one process group.
#[derive(Debug)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
    pub join: Join,
    pub pgid: Option<Pid>,
    /// Status of the last stage, known once every stage was waited on.
    pub status: Option<i32>,
}

impl Pipeline {
    pub fn is_background(&self) -> bool {
        self.join == Join::Background
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", stage.argv.join(" "))?;
        }
        Ok(())
    }
}

/// The pipelines of one input line, in written order.
#[derive(Debug, Default)]
pub struct CommandList {
    pub pipelines: Vec<Pipeline>,
}

impl CommandList {
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

struct Builder {
    list: Vec<Pipeline>,
    stages: Vec<Stage>,
    current: Stage,
    saw_empty: bool,
}

impl Builder {
    fn new() -> Self {
        Builder {
            list: Vec::new(),
            stages: Vec::new(),
            current: Stage::new(),
            saw_empty: false,
        }
    }

    fn close_stage(&mut self) {
        let stage = std::mem::replace(&mut self.current, Stage::new());
        self.stages.push(stage);
    }

    /// Closes the current pipeline with `join`. Returns false if it had no
    /// command in it.
    fn close_pipeline(&mut self, join: Join) -> bool {
        if self.current.argv.is_empty() {
            self.current = Stage::new();
            return false;
        }
        self.close_stage();
        let mut stages = std::mem::take(&mut self.stages);
        let last = stages.len() - 1;
        if last > 0 {
            for (i, stage) in stages.iter_mut().enumerate() {
                stage.pipe_role = match i {
                    0 => PipeRole::WritesNext,
                    i if i == last => PipeRole::ReadsPrevious,
                    _ => PipeRole::Both,
                };
            }
        }
        self.list.push(Pipeline {
            stages,
            join,
            pgid: None,
            status: None,
        });
        true
    }
}

/// Builds the command list of one line from its tokens.
///
/// Redirections attach to the stage being built; `|` starts a new stage of
/// the same pipeline; `;`, `&`, `&&`, `||` and the end of input close the
/// pipeline and record the operator as its join. A line with an empty
/// command between two control operators produces an empty list, which is
/// never executed.
pub fn build<I>(tokens: I) -> Result<CommandList, ParseError>
where
    I: IntoIterator<Item = Token>,
{
    let mut b = Builder::new();
    let mut iter = tokens.into_iter();
    let mut last_join = None;

    while let Some(token) = iter.next() {
        let join = match token.kind {
            TokenKind::Word => {
                b.current.argv.push(token.text);
                continue;
            }
            TokenKind::Redirect => {
                match iter.next() {
                    Some(target) if target.kind == TokenKind::Word => {
                        let redirection = Redirection::from_operator(&token.text, target.text);
                        b.current.redirections.push(redirection);
                    }
                    _ => return Err(ParseError::MissingRedirectTarget(token.text)),
                }
                continue;
            }
            TokenKind::Pipe => {
                if b.current.argv.is_empty() {
                    return Err(ParseError::DanglingOperator(token.text));
                }
                b.close_stage();
                continue;
            }
            TokenKind::LParen | TokenKind::RParen => {
                return Err(ParseError::Unsupported(token.text));
            }
            TokenKind::Sequence => Join::Sequence,
            TokenKind::Background => Join::Background,
            TokenKind::And => Join::And,
            TokenKind::Or => Join::Or,
        };
        if !b.stages.is_empty() && b.current.argv.is_empty() {
            return Err(ParseError::DanglingOperator("|".into()));
        }
        if !b.close_pipeline(join) {
            b.saw_empty = true;
        }
        last_join = Some((join, token.text));
    }

    if !b.stages.is_empty() && b.current.argv.is_empty() {
        return Err(ParseError::DanglingOperator("|".into()));
    }
    if !b.close_pipeline(Join::End) {
        if let Some((Join::And | Join::Or, op)) = last_join {
            return Err(ParseError::DanglingOperator(op));
        }
    }

    if b.saw_empty {
        log::debug!("empty command in line, skipping it");
        return Ok(CommandList::default());
    }
    Ok(CommandList { pipelines: b.list })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tokens;

    fn parse(input: &str) -> Result<CommandList, ParseError> {
        build(tokens(input))
    }

    #[test]
    fn test_parse_command_line() {
        let list = parse("grep 'pattern' < input.txt | sort > output.txt &").unwrap();
        assert_eq!(list.pipelines.len(), 1);
        let pipeline = &list.pipelines[0];
        assert_eq!(pipeline.join, Join::Background);
        let grep = &pipeline.stages[0];
        assert_eq!(grep.argv, vec!["grep", "pattern"]);
        assert_eq!(
            grep.redirections,
            vec![Redirection {
                stream: Stream::Stdin,
                mode: Mode::Read,
                target: "input.txt".into()
            }]
        );
        assert_eq!(grep.pipe_role, PipeRole::WritesNext);
        let sort = &pipeline.stages[1];
        assert_eq!(sort.argv, vec!["sort"]);
        assert_eq!(sort.redirections[0].stream, Stream::Stdout);
        assert_eq!(sort.redirections[0].mode, Mode::Truncate);
        assert_eq!(sort.pipe_role, PipeRole::ReadsPrevious);
        assert!(sort.pid.is_none());
        assert!(pipeline.pgid.is_none());
    }

    #[test]
    fn test_joins_in_order() {
        let list = parse("a ; b & c && d || e").unwrap();
        let joins: Vec<Join> = list.pipelines.iter().map(|p| p.join).collect();
        assert_eq!(
            joins,
            vec![Join::Sequence, Join::Background, Join::And, Join::Or, Join::End]
        );
    }

    #[test]
    fn test_pipe_roles() {
        let list = parse("a | b | c").unwrap();
        let roles: Vec<PipeRole> = list.pipelines[0].stages.iter().map(|s| s.pipe_role).collect();
        assert_eq!(
            roles,
            vec![PipeRole::WritesNext, PipeRole::Both, PipeRole::ReadsPrevious]
        );
        let single = parse("a").unwrap();
        assert_eq!(single.pipelines[0].stages[0].pipe_role, PipeRole::None);
    }

    #[test]
    fn test_redirections_keep_declaration_order() {
        let list = parse("cmd > a 2>> b >> c < d").unwrap();
        let redirs = &list.pipelines[0].stages[0].redirections;
        let summary: Vec<(Stream, Mode, &str)> = redirs
            .iter()
            .map(|r| (r.stream, r.mode, r.target.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (Stream::Stdout, Mode::Truncate, "a"),
                (Stream::Stderr, Mode::Append, "b"),
                (Stream::Stdout, Mode::Append, "c"),
                (Stream::Stdin, Mode::Read, "d"),
            ]
        );
    }

    #[test]
    fn test_trailing_sequence_and_background() {
        let list = parse("echo a ;").unwrap();
        assert_eq!(list.pipelines.len(), 1);
        assert_eq!(list.pipelines[0].join, Join::Sequence);

        let list = parse("sleep 5 &").unwrap();
        assert_eq!(list.pipelines.len(), 1);
        assert!(list.pipelines[0].is_background());
    }

    #[test]
    fn test_empty_line_and_empty_command() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("   ").unwrap().is_empty());
        assert!(parse("echo a ; ; echo b").unwrap().is_empty());
        assert!(parse("; echo a").unwrap().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse("cat <").unwrap_err(),
            ParseError::MissingRedirectTarget("<".into())
        );
        assert_eq!(
            parse("cat > | wc").unwrap_err(),
            ParseError::MissingRedirectTarget(">".into())
        );
        assert_eq!(
            parse("echo a &&").unwrap_err(),
            ParseError::DanglingOperator("&&".into())
        );
        assert_eq!(
            parse("echo a | ; b").unwrap_err(),
            ParseError::DanglingOperator("|".into())
        );
        assert_eq!(
            parse("| wc").unwrap_err(),
            ParseError::DanglingOperator("|".into())
        );
        assert_eq!(
            parse("echo a |").unwrap_err(),
            ParseError::DanglingOperator("|".into())
        );
        assert_eq!(
            parse("(echo a)").unwrap_err(),
            ParseError::Unsupported("(".into())
        );
    }

    #[test]
    fn test_join_guards() {
        assert!(Join::And.admits(0));
        assert!(!Join::And.admits(1));
        assert!(Join::Or.admits(3));
        assert!(!Join::Or.admits(0));
        assert!(Join::Sequence.admits(1));
        assert!(Join::Background.admits(1));
    }

    #[test]
    fn test_display_pipeline() {
        let list = parse("echo a b | tr a b > out").unwrap();
        assert_eq!(list.pipelines[0].to_string(), "echo a b | tr a b");
    }
}
