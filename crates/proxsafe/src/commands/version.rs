//! Version command

use crate::cli::VersionArgs;
use crate::output;
use crate::version::VersionInfo;
use anyhow::Result;

pub fn run(args: VersionArgs) -> Result<()> {
    let info = VersionInfo::current();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("{}", info);
    let l = &info.libraries;
    println!("Libraries: core {}, backup {}, restore {}", l.core, l.backup, l.restore);
    if info.is_mixed() {
        output::warning("Libraries were built from a different version than the binary");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::version::{Libraries, VersionInfo};

    fn sample(git_sha: Option<&str>, build_date: Option<&str>, target: Option<&str>) -> VersionInfo {
        VersionInfo {
            version: "1.2.3".to_string(),
            git_sha: git_sha.map(String::from),
            build_date: build_date.map(String::from),
            target: target.map(String::from),
            libraries: Libraries {
                core: "1.2.3".to_string(),
                backup: "1.2.3".to_string(),
                restore: "1.2.3".to_string(),
            },
        }
    }

    #[test]
    fn test_current_links_matching_libraries() {
        let info = VersionInfo::current();
        assert_eq!(info.version.split('.').count(), 3);
        assert!(!info.is_mixed());
    }

    #[test]
    fn test_stamp_carries_commit_when_known() {
        assert_eq!(sample(Some("abc12345"), None, None).stamp(), "1.2.3+abc12345");
        assert_eq!(sample(None, None, None).stamp(), "1.2.3");
    }

    #[test]
    fn test_display() {
        let full = sample(Some("abc12345"), Some("2024-05-01"), Some("x86_64-unknown-linux-gnu"));
        assert_eq!(
            full.to_string(),
            "proxsafe 1.2.3+abc12345 (built 2024-05-01 for x86_64-unknown-linux-gnu)"
        );
        assert_eq!(sample(None, None, None).to_string(), "proxsafe 1.2.3");
    }

    #[test]
    fn test_mixed_library_versions_detected() {
        let mut info = sample(None, None, None);
        info.libraries.restore = "1.2.4".to_string();
        assert!(info.is_mixed());
    }

    #[test]
    fn test_json_nests_libraries() {
        let json = serde_json::to_value(sample(Some("abc12345"), None, None)).unwrap();
        assert_eq!(json["git_sha"], "abc12345");
        assert_eq!(json["libraries"]["restore"], "1.2.3");
    }
}
