//! Configuration overrides given as `-c key=value` arguments.

use config::{ConfigError, Source, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// A configuration source made of toml lines from the command line.
///
/// Each line is one toml assignment, such as `sim.hops=4` or
/// `dispatch.batch.send_delay="100ms"`.  A value that is a single bare
/// word, as in `dispatch.clock_fudge=90s`, is quoted for you.
#[derive(Debug, Clone, Default)]
pub(crate) struct Overrides {
    /// The lines, in the order given.
    lines: Vec<String>,
}

impl Overrides {
    /// Collect overrides from command-line arguments.
    pub(crate) fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Overrides {
            lines: args.into_iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    /// Join the lines into one toml document.
    fn document(&self) -> String {
        self.lines
            .iter()
            .map(|l| quote_bareword(l).unwrap_or_else(|| l.clone()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Rewrite a toml error to name the argument it came from.
    fn explain(&self, err: &toml::de::Error) -> String {
        static POSITION: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^(.*?) at line [0-9]+ column [0-9]+$").expect("invalid built-in regex")
        });
        let text = err.to_string();
        let what = POSITION
            .captures(&text)
            .and_then(|c| c.get(1))
            .map_or(text.as_str(), |m| m.as_str());
        match err.line_col().and_then(|(line, _)| self.lines.get(line)) {
            Some(arg) => format!("{} in option {:?}", what, arg),
            None => format!("{} in command-line options", what),
        }
    }
}

impl Source for Overrides {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<HashMap<String, Value>, ConfigError> {
        let parsed: toml::Value =
            toml::from_str(&self.document()).map_err(|e| ConfigError::Message(self.explain(&e)))?;
        parsed
            .try_into()
            .map_err(|e| ConfigError::Foreign(Box::new(e)))
    }
}

/// If `line` is `dotted.key=bareword`, return it with the bareword in
/// quotes.
fn quote_bareword(line: &str) -> Option<String> {
    static ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r#"(?x:
               ^ [ \t]*
               ((?:[a-zA-Z0-9_\-]+\.)* [a-zA-Z0-9_\-]+)
               [ \t]* = [ \t]*
               ([a-zA-Z0-9_]+)
               [ \t]* $)"#,
        )
        .expect("invalid built-in regex")
    });
    let c = ASSIGNMENT.captures(line)?;
    let value = &c[2];
    // Numbers and booleans are already valid toml.
    if value.parse::<i64>().is_ok() || value == "true" || value == "false" {
        return None;
    }
    Some(format!("{}=\"{}\"", &c[1], value))
}
