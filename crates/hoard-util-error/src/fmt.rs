use std::fmt;

/// Render an error and its source chain on a single line.
///
/// Multi-line `Debug` dumps are hostile to structured log fields; this
/// walks `Error::source` and joins each message with `: `.
pub struct CompactError<'e>(&'e (dyn std::error::Error + 'static));

impl fmt::Display for CompactError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

pub trait FmtCompact {
    fn fmt_compact(&self) -> CompactError<'_>;
}

impl<E> FmtCompact for E
where
    E: std::error::Error + 'static,
{
    fn fmt_compact(&self) -> CompactError<'_> {
        CompactError(self)
    }
}

/// Like [`FmtCompact`], but for `dyn` errors behind a box.
pub trait FmtCompactDyn {
    fn fmt_compact_dyn(&self) -> CompactError<'_>;
}

impl FmtCompactDyn for super::BoxedError {
    fn fmt_compact_dyn(&self) -> CompactError<'_> {
        CompactError(self.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(Inner);

    #[derive(Debug)]
    struct Inner;

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "outer failed")
        }
    }
    impl fmt::Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "inner cause")
        }
    }
    impl std::error::Error for Inner {}
    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn chains_sources_on_one_line() {
        assert_eq!(
            Outer(Inner).fmt_compact().to_string(),
            "outer failed: inner cause"
        );
    }
}
