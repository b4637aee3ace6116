use std::error::Error;
use std::fmt;

/// Formats an error together with its chain of sources, separated by `: `.
///
/// `Display` on a bare error only prints the top-most message, which hides
/// the underlying cause in log lines.
pub fn err_with_src(e: &dyn Error) -> ErrorWithSources<'_> {
    ErrorWithSources { e }
}

pub struct ErrorWithSources<'a> {
    e: &'a dyn Error,
}

impl fmt::Display for ErrorWithSources<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.e)?;

        let mut current = self.e.source();

        while let Some(source) = current {
            write!(f, ": {source}")?;

            current = source.source();
        }

        Ok(())
    }
}
