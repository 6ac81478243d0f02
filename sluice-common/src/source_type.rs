/// Where a track's bytes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    /// A file on the local filesystem, decoded by path
    Local,
    /// A FLAC file behind an HTTP server that honors range requests
    Remote,
}

impl SourceType {
    /// Guess the source type from a source reference.
    ///
    /// Anything with an `http://` or `https://` scheme is remote.
    pub fn detect(source_ref: &str) -> Self {
        let lower = source_ref.trim_start().to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceType::Remote
        } else {
            SourceType::Local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_remote_schemes() {
        assert_eq!(SourceType::detect("https://host/a.flac"), SourceType::Remote);
        assert_eq!(SourceType::detect("HTTP://host/a.flac"), SourceType::Remote);
    }

    #[test]
    fn test_detect_local_paths() {
        assert_eq!(SourceType::detect("/music/a.flac"), SourceType::Local);
        assert_eq!(SourceType::detect("C:\\music\\a.flac"), SourceType::Local);
        assert_eq!(SourceType::detect("httpfoo.flac"), SourceType::Local);
    }
}
