//! A configuration source built from `-c` command-line options.

use std::collections::HashMap;

use config::{ConfigError, Source, Value};
use once_cell::sync::Lazy;
use regex::Regex;

/// Alias for the Result type from config.
type Result<T> = std::result::Result<T, ConfigError>;

/// A set of command-line options that augment a configuration.
///
/// Each option is a line of toml; together they are read as a single toml
/// document.  An option of the form `key=bareword` has its bareword quoted,
/// so that `-c policy=allow_all` doesn't need shell-escaped quotes.
#[derive(Debug, Clone, Default)]
pub(crate) struct CmdLine {
    /// The options, in the order they were given.
    contents: Vec<String>,
}

impl CmdLine {
    /// Make a new empty set of options.
    pub(crate) fn new() -> Self {
        CmdLine::default()
    }

    /// Add a single line of toml.
    pub(crate) fn push_toml_line(&mut self, line: String) {
        self.contents.push(line);
    }

    /// Join our options into one toml document.
    fn build_toml(&self) -> String {
        let mut toml_s = String::new();
        for line in &self.contents {
            toml_s.push_str(quote_bareword(line).as_deref().unwrap_or(line));
            toml_s.push('\n');
        }
        toml_s
    }

    /// Rewrite the toml error message `msg`, found at `pos`, so that it
    /// names the option it came from instead of a line and column.
    fn describe_error(&self, msg: &str, pos: Option<(usize, usize)>) -> String {
        /// Matches the position suffix that toml puts on its messages.
        static POSITION: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^(.*?) at line [0-9]+ column [0-9]+$")
                .expect("Built-in regex compilation failed")
        });
        let msg = POSITION
            .captures(msg)
            .and_then(|c| c.get(1))
            .map_or(msg, |m| m.as_str());

        match pos {
            Some((line, _col)) if line < self.contents.len() => {
                format!("{} in {:?}", msg, self.contents[line])
            }
            _ => format!("{} on command line", msg),
        }
    }
}

impl Source for CmdLine {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<HashMap<String, Value>> {
        let toml_v: toml::Value = toml::from_str(&self.build_toml()).map_err(|e| {
            ConfigError::Message(self.describe_error(&e.to_string(), e.line_col()))
        })?;

        toml_v
            .try_into()
            .map_err(|e| ConfigError::Foreign(Box::new(e)))
    }
}

/// If `s` has the form `key=bareword`, return it with the bareword quoted.
///
/// Keys may be dotted; barewords are letters, digits and underscores.
/// `config` turns quoted numbers and booleans back into what the target
/// field wants.
fn quote_bareword(s: &str) -> Option<String> {
    /// Matches `key=bareword`, capturing both sides.
    static BAREWORD: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r#"(?x:
               ^
                [ \t]*
                # first capture group: dotted key
                ((?:[a-zA-Z0-9_\-]+\.)*
                 [a-zA-Z0-9_\-]+)
                [ \t]*=[ \t]*
                # second group: one bareword without hyphens
                ([a-zA-Z0-9_]+)
                [ \t]*
                $)"#,
        )
        .expect("Built-in regex compilation failed")
    });

    BAREWORD
        .captures(s)
        .map(|c| format!("{}=\"{}\"", &c[1], &c[2]))
}
