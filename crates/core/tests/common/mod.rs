use std::fs;
use std::path::{Path, PathBuf};

/// Shell script emulating `exiftool -stay_open True -@ -` closely enough for
/// protocol tests: it consumes argument batches from stdin, answers `-ver`,
/// fabricates JSON for `-json` reads, confirms tag writes, and emits the
/// numbered ready/stderr sentinels.
///
/// File-name markers steer its behaviour so tests can stage corruption:
/// a path containing `unreadable` fails the JSON read, `makernotes` refuses
/// writes with a MakerNotes warning, and `slow` stalls before answering.
const STUB_TOOL: &str = r#"#!/bin/sh
paths=""
stderr_marker=""
ver=0
json=0
write=0
bad_read=0
bad_write=0
slow=0
while IFS= read -r line; do
  case "$line" in
    -stay_open)
      IFS= read -r value
      [ "$value" = "False" ] && exit 0
      ;;
    -echo4)
      IFS= read -r stderr_marker
      ;;
    -execute*)
      n="${line#-execute}"
      [ "$slow" = 1 ] && sleep 3
      if [ "$ver" = 1 ]; then
        printf '12.76\n'
      elif [ "$json" = 1 ] && [ "$bad_read" = 1 ]; then
        printf 'Error: File format error - stub\n' >&2
      elif [ "$json" = 1 ]; then
        out="["
        first=1
        oldifs=$IFS
        IFS='
'
        set -f
        for p in $paths; do
          [ "$first" = 0 ] && out="$out,"
          out="$out{\"SourceFile\":\"$p\",\"CreateDate\":\"2023:07:14 10:30:00\"}"
          first=0
        done
        set +f
        IFS=$oldifs
        printf '%s]\n' "$out"
      elif [ "$write" = 1 ] && [ "$bad_write" = 1 ]; then
        printf '0 image files updated\n'
        printf 'Warning: [minor] MakerNotes offsets may be incorrect\n' >&2
      elif [ "$write" = 1 ]; then
        printf '    1 image files updated\n'
      else
        oldifs=$IFS
        IFS='
'
        set -f
        for p in $paths; do
          printf '%s\n' "$p"
        done
        set +f
        IFS=$oldifs
      fi
      printf '{ready%s}\n' "$n"
      [ -n "$stderr_marker" ] && printf '%s\n' "$stderr_marker" >&2
      paths=""
      stderr_marker=""
      ver=0
      json=0
      write=0
      bad_read=0
      bad_write=0
      slow=0
      ;;
    -ver)
      ver=1
      ;;
    -json)
      json=1
      ;;
    -charset|-tagsfromfile)
      IFS= read -r skipped
      ;;
    -@)
      IFS= read -r argfile
      paths="$(cat "$argfile")"
      case "$paths" in *unreadable*) bad_read=1 ;; esac
      case "$paths" in *makernotes*) bad_write=1 ;; esac
      case "$paths" in *slow*) slow=1 ;; esac
      ;;
    -*=*)
      write=1
      ;;
    -*)
      ;;
    *)
      if [ -z "$paths" ]; then
        paths="$line"
      else
        paths="$paths
$line"
      fi
      case "$line" in *slow*) slow=1 ;; esac
      ;;
  esac
done
"#;

pub fn write_stub_tool(dir: &Path) -> PathBuf {
    let path = dir.join("exiftool-stub");
    fs::write(&path, STUB_TOOL).expect("write stub tool");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(&path).expect("stat stub").permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions).expect("chmod stub");
    }
    path
}

pub fn write_media_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("image bytes of {name}")).expect("write media fixture");
    path
}
