//! Handler fixtures for subprocess loader tests
//!
//! Fixtures are POSIX shell scripts speaking the describe/invoke protocol;
//! map `.sh` to `sh` when building a loader for them.

use std::path::{Path, PathBuf};

/// Module exporting `handler` (echoes its input back as the result), `fail`
/// (reports a `TypeError`), a non-callable `version`, and a default export
/// that crashes
pub const ECHO_MODULE: &str = r#"
case "$RUNLOOP_MODE" in
  describe)
    echo '{"exports":{"handler":"function","fail":"function","version":"string"},"default":"function"}'
    ;;
  invoke)
    input=$(cat)
    case "$RUNLOOP_EXPORT" in
      handler)
        echo "handling $RUNLOOP_EXPORT"
        printf '{"result":%s}\n' "$input"
        ;;
      fail)
        echo '{"error":{"errorType":"TypeError","errorMessage":"boom","stackTrace":["at fail (mod.sh)"]}}'
        ;;
      *)
        echo "unknown export $RUNLOOP_EXPORT" >&2
        exit 1
        ;;
    esac
    ;;
  *)
    exit 2
    ;;
esac
"#;

/// Module exporting only a non-callable `handler`
pub const VALUE_ONLY_MODULE: &str = r#"
if [ "$RUNLOOP_MODE" = "describe" ]; then
  echo '{"exports":{"handler":"object"},"default":null}'
fi
"#;

/// Write an executable script into `dir`
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).expect("Failed to write fixture");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to mark fixture executable");
    }

    path
}
