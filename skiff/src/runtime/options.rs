use crate::error::SessionError;

/// Command-line options of one session.
///
/// Recognized flags come first. The first token that is not one of them
/// starts [`ScriptOptions::args`], which are passed through untouched:
/// the script path followed by its own arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOptions {
    /// `-v` / `--version`
    pub print_version: bool,
    /// `-e` / `--eval <source>`
    pub eval: Option<String>,
    /// `-p` / `--print`
    pub print: bool,
    /// `-i` / `--interactive`
    pub interactive: bool,
    /// `--no-deprecation`
    pub no_deprecation: bool,
    /// `--trace-deprecation`
    pub trace_deprecation: bool,
    pub args: Vec<String>,
}

impl ScriptOptions {
    /// Parses `args`, which excludes the executable name.
    ///
    /// # Errors
    ///
    /// [`SessionError::MissingArgument`] if `-e` is the last token.
    pub fn parse<I, S>(args: I) -> Result<Self, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut options = Self::default();
        let mut tokens = args.into_iter().map(Into::into);

        while let Some(token) = tokens.next() {
            match token.as_str() {
                "-v" | "--version" => options.print_version = true,
                "-e" | "--eval" => match tokens.next() {
                    Some(source) => options.eval = Some(source),
                    None => return Err(SessionError::MissingArgument { flag: token }),
                },
                "-p" | "--print" => options.print = true,
                "-i" | "--interactive" => options.interactive = true,
                "--no-deprecation" => options.no_deprecation = true,
                "--trace-deprecation" => options.trace_deprecation = true,
                _ => {
                    options.args.push(token);
                    options.args.extend(tokens.by_ref());
                    break;
                }
            }
        }

        Ok(options)
    }

    /// The script to run, if one was named.
    pub fn script_path(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}
