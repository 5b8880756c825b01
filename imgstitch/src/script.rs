// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! POSIX shell script emission. The script carries the reconstruction plan as
//! a sequence of `emit_literal`/`emit_copy` steps plus a raw binary payload
//! appended after an `exit` guard. Everything it runs at reconstruction time
//! is plain POSIX sh and standard utilities (awk, dd, tail, head, wc).

use std::{
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{
    metadata::FileMetadata,
    plan::{Plan, Segment},
    stream::{self, PSeekFile, Reopen},
};

/// Marker separating the shell text from the binary literal payload. The
/// script locates it with awk at runtime, so it must stay on a line of its
/// own and must never change between releases reading old scripts.
const PAYLOAD_MARKER: &str = "__IMGSTITCH_PAYLOAD__";

/// Heredoc delimiter for embedded ACL text.
const ACL_MARKER: &str = "__IMGSTITCH_ACL__";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read image {path:?} at offset {offset}")]
    ImageRead {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write script")]
    Write {
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

pub struct ScriptParams<'a> {
    /// Display name of the image, for the banner and final message only.
    pub image_name: &'a str,
    /// Checksum of the complete image, if it was computed. The script
    /// verifies the rebuilt output against this.
    pub image_sha256: Option<[u8; 32]>,
    /// Default dd transfer size for aligned copies.
    pub block_size: u32,
}

/// Write the complete reconstruction script: shell text first, then the
/// binary payload containing every literal segment's bytes in plan order.
pub fn emit(
    mut writer: impl Write,
    image_path: &Path,
    image: &PSeekFile,
    plan: &Plan,
    files: &[FileMetadata],
    params: &ScriptParams,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let text = render_text(plan, files, params).map_err(|e| Error::Write { source: e })?;

    writer
        .write_all(&text)
        .map_err(|e| Error::Write { source: e })?;

    // The payload is the concatenation of the literal segments, in plan
    // order, matching the relative offsets baked into the emit_literal steps.
    let mut image = image.reopen().map_err(|e| Error::ImageRead {
        path: image_path.to_owned(),
        offset: 0,
        source: e,
    })?;

    for segment in &plan.segments {
        let Segment::Literal {
            image_offset,
            length,
        } = segment
        else {
            continue;
        };

        image
            .seek(SeekFrom::Start(*image_offset))
            .map_err(|e| Error::ImageRead {
                path: image_path.to_owned(),
                offset: *image_offset,
                source: e,
            })?;

        stream::copy_n(&mut image, &mut writer, *length, cancel_signal).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::ImageRead {
                    path: image_path.to_owned(),
                    offset: *image_offset,
                    source: e,
                }
            } else {
                Error::Write { source: e }
            }
        })?;
    }

    writer.flush().map_err(|e| Error::Write { source: e })?;

    debug!(
        "Emitted script: {} text bytes, {} payload bytes",
        text.len(),
        plan.literal_bytes(),
    );

    Ok(())
}

/// Render the shell text, up to and including the payload marker line.
fn render_text(
    plan: &Plan,
    files: &[FileMetadata],
    params: &ScriptParams,
) -> io::Result<Vec<u8>> {
    let mut text = Vec::<u8>::new();
    let w = &mut text;

    writeln!(w, "#!/bin/sh")?;
    writeln!(
        w,
        "# Generated by imgstitch {}. Rebuilds {} ({} bytes) from extracted",
        env!("CARGO_PKG_VERSION"),
        params.image_name,
        plan.image_size,
    )?;
    writeln!(
        w,
        "# files plus data embedded in this script. Run with -h for usage.",
    )?;
    writeln!(w, "set -u")?;
    writeln!(w)?;

    write!(w, "image_name=")?;
    w.write_all(&sh_quote_str(params.image_name))?;
    writeln!(w)?;
    writeln!(w, "image_size={}", plan.image_size)?;
    writeln!(
        w,
        "image_sha256='{}'",
        params.image_sha256.map(hex::encode).unwrap_or_default(),
    )?;
    writeln!(w, "script_block_size={}", params.block_size)?;

    w.write_all(PRELUDE.as_bytes())?;

    // File verification, in input-list order.
    writeln!(w, "say 'Verifying extracted files'")?;
    for file in files {
        write!(w, "verify_file ")?;
        w.write_all(&sh_quote(&file.path))?;
        writeln!(
            w,
            " {} {} {}",
            file.size,
            file.md5.map_or_else(|| "-".to_owned(), hex::encode),
            file.sha256.map_or_else(|| "-".to_owned(), hex::encode),
        )?;
    }
    writeln!(w)?;
    w.write_all(CHECK_ONLY_EXIT.as_bytes())?;

    // Reconstruction steps. Literal offsets are relative to the start of the
    // payload, which holds the literals contiguously in plan order.
    let mut literal_offset = 0u64;

    writeln!(w, "say \"Writing $out\"")?;
    writeln!(w, "tmp_out=\"$out.imgstitch.tmp\"")?;
    writeln!(w, ": > \"$tmp_out\" || die \"cannot write to $tmp_out\"")?;
    writeln!(w, "{{")?;

    for segment in &plan.segments {
        match segment {
            Segment::Literal {
                image_offset,
                length,
            } => {
                writeln!(
                    w,
                    "    say '  embedded data -> image offset {image_offset} ({length} bytes)'",
                )?;
                writeln!(w, "    emit_literal {literal_offset} {length}")?;
                literal_offset += length;
            }
            Segment::Copy {
                path,
                file_offset,
                image_offset,
                length,
            } => {
                write!(w, "    say \"  \"")?;
                w.write_all(&sh_quote(path))?;
                writeln!(
                    w,
                    "\" @{file_offset} -> image offset {image_offset} ({length} bytes)\"",
                )?;
                write!(w, "    emit_copy \"$(locate ")?;
                w.write_all(&sh_quote(path))?;
                writeln!(w, ")\" {file_offset} {length}")?;
            }
        }
    }

    writeln!(w, "}} > \"$tmp_out\"")?;
    w.write_all(FINISH_IMAGE.as_bytes())?;

    // Metadata restore, after the image is in place.
    writeln!(w, "say 'Restoring file metadata'")?;
    for file in files {
        write!(w, "restore_file ")?;
        w.write_all(&sh_quote(&file.path))?;
        write!(w, " {:04o} ", file.mode)?;
        match (file.uid, file.gid) {
            (Some(uid), Some(gid)) => write!(w, "{uid}:{gid}")?,
            _ => write!(w, "-")?,
        }
        writeln!(
            w,
            " {}",
            touch_timestamp(file.mtime_secs).unwrap_or_else(|| "-".to_owned()),
        )?;

        if let Some(acl) = &file.acl {
            write!(w, "restore_acl ")?;
            w.write_all(&sh_quote(&file.path))?;
            writeln!(w, " <<'{ACL_MARKER}'")?;
            writeln!(w, "{acl}")?;
            writeln!(w, "{ACL_MARKER}")?;
        }
    }
    writeln!(w)?;

    writeln!(w, "echo \"Rebuilt $out ($image_size bytes).\" >&2")?;
    writeln!(w, "exit 0")?;
    writeln!(w, "{PAYLOAD_MARKER}")?;

    Ok(text)
}

/// Static shell helpers shared by every generated script.
const PRELUDE: &str = r#"
out=''
tree=''
check_only=0
skip_md5=0
skip_sha256=0
skip_perms=0
skip_times=0
skip_acl=0
keep_going=0
verbose=0
dd_bs=$script_block_size

usage() {
    cat <<EOF
Usage: $0 [-i] [-o FILE] [-T DIR] [-M] [-S] [-p] [-t] [-a] [-x] [-v] [-b BYTES]

Rebuild $image_name ($image_size bytes) from extracted files.

  -o FILE   Write the rebuilt image to FILE
  -i        Only verify the extracted files; do not rebuild
  -T DIR    Directory containing the extracted files (default: current)
  -M        Skip MD5 verification
  -S        Skip SHA-256 verification
  -p        Do not restore file permissions or ownership
  -t        Do not restore file timestamps
  -a        Do not restore file ACLs
  -b BYTES  dd transfer size for aligned copies (default: $script_block_size)
  -x        Continue past verification failures
  -v        Verbose output
EOF
}

while getopts 'io:T:MSptab:xvh' opt; do
    case $opt in
        i) check_only=1 ;;
        o) out=$OPTARG ;;
        T) tree=$OPTARG ;;
        M) skip_md5=1 ;;
        S) skip_sha256=1 ;;
        p) skip_perms=1 ;;
        t) skip_times=1 ;;
        a) skip_acl=1 ;;
        b) dd_bs=$OPTARG ;;
        x) keep_going=1 ;;
        v) verbose=1 ;;
        h) usage; exit 0 ;;
        *) usage >&2; exit 2 ;;
    esac
done

if [ "$check_only" -eq 0 ] && [ -z "$out" ]; then
    usage >&2
    exit 2
fi
[ "$dd_bs" -gt 0 ] 2>/dev/null || { echo "Error: invalid -b value" >&2; exit 2; }

say() {
    [ "$verbose" -eq 1 ] && echo "$@" >&2
    return 0
}

die() {
    echo "Error: $*" >&2
    [ -n "${tmp_out:-}" ] && rm -f "$tmp_out"
    exit 1
}

fail() {
    if [ "$keep_going" -eq 1 ]; then
        echo "Warning: $*" >&2
    else
        die "$@"
    fi
}

payload_line=$(awk -v marker="__IMGSTITCH_PAYLOAD__" '$0 == marker { print NR + 1; exit }' "$0")
[ -n "$payload_line" ] || die "corrupt script: payload marker not found"

locate() {
    case $1 in
        /*) printf '%s' "$tree$1" ;;
        *) printf '%s' "${tree:+$tree/}$1" ;;
    esac
}

emit_literal() { # payload-offset count
    tail -n +"$payload_line" "$0" | tail -c +"$(( $1 + 1 ))" | head -c "$2"
}

emit_copy() { # file skip count
    if [ "$(( $2 % dd_bs ))" -eq 0 ] && [ "$(( $3 % dd_bs ))" -eq 0 ]; then
        dd if="$1" bs="$dd_bs" skip="$(( $2 / dd_bs ))" count="$(( $3 / dd_bs ))" 2>/dev/null
    else
        tail -c +"$(( $2 + 1 ))" "$1" | head -c "$3"
    fi
}

file_digest() { # tool file
    "$1" < "$2" | awk '{ print $1; exit }'
}

verify_file() { # path size md5 sha256
    f=$(locate "$1")
    [ -f "$f" ] || { fail "missing file: $f"; return 1; }

    actual_size=$(wc -c < "$f")
    [ "$actual_size" -eq "$2" ] || { fail "$f: size is $actual_size, expected $2"; return 1; }

    if [ "$skip_md5" -eq 0 ] && [ "$3" != '-' ] && command -v md5sum >/dev/null 2>&1; then
        actual=$(file_digest md5sum "$f")
        [ "$actual" = "$3" ] || { fail "$f: MD5 is $actual, expected $3"; return 1; }
    fi
    if [ "$skip_sha256" -eq 0 ] && [ "$4" != '-' ] && command -v sha256sum >/dev/null 2>&1; then
        actual=$(file_digest sha256sum "$f")
        [ "$actual" = "$4" ] || { fail "$f: SHA-256 is $actual, expected $4"; return 1; }
    fi

    say "verified $f"
    return 0
}

restore_file() { # path mode owner mtime
    f=$(locate "$1")

    if [ "$skip_perms" -eq 0 ]; then
        chmod "$2" "$f" || echo "Warning: failed to chmod $f" >&2
        if [ "$3" != '-' ]; then
            chown "$3" "$f" 2>/dev/null \
                || echo "Warning: failed to chown $f (are you root?)" >&2
        fi
    fi
    if [ "$skip_times" -eq 0 ] && [ "$4" != '-' ]; then
        TZ=UTC touch -t "$4" "$f" || echo "Warning: failed to set mtime of $f" >&2
    fi
}

restore_acl() { # path, ACL text on stdin
    f=$(locate "$1")

    if [ "$skip_acl" -eq 0 ] && command -v setfacl >/dev/null 2>&1; then
        setfacl --set-file=- "$f" || echo "Warning: failed to restore ACL of $f" >&2
    else
        cat > /dev/null
    fi
}

"#;

const CHECK_ONLY_EXIT: &str = r#"if [ "$check_only" -eq 1 ]; then
    echo "File verification finished." >&2
    exit 0
fi

"#;

const FINISH_IMAGE: &str = r#"
actual_size=$(wc -c < "$tmp_out")
[ "$actual_size" -eq "$image_size" ] \
    || die "rebuilt image is $actual_size bytes, expected $image_size"

if [ "$skip_sha256" -eq 0 ] && [ -n "$image_sha256" ] \
    && command -v sha256sum >/dev/null 2>&1; then
    actual=$(file_digest sha256sum "$tmp_out")
    [ "$actual" = "$image_sha256" ] \
        || die "rebuilt image SHA-256 is $actual, expected $image_sha256"
    say 'Image checksum OK'
fi

mv -f "$tmp_out" "$out" || die "cannot move $tmp_out to $out"

"#;

/// Quote a path for safe interpolation into the script. Single quotes pass
/// every byte through untouched except the quote itself.
fn sh_quote(path: &Path) -> Vec<u8> {
    #[cfg(unix)]
    let bytes = {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes()
    };

    #[cfg(not(unix))]
    let owned = path.to_string_lossy().into_owned();
    #[cfg(not(unix))]
    let bytes = owned.as_bytes();

    sh_quote_bytes(bytes)
}

fn sh_quote_str(s: &str) -> Vec<u8> {
    sh_quote_bytes(s.as_bytes())
}

fn sh_quote_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 2);

    out.push(b'\'');
    for &b in bytes {
        if b == b'\'' {
            out.extend_from_slice(b"'\\''");
        } else {
            out.push(b);
        }
    }
    out.push(b'\'');

    out
}

/// Format an mtime for `TZ=UTC touch -t`. Sub-second precision is dropped;
/// timestamps `touch -t` can't express (before 1970) are skipped entirely.
fn touch_timestamp(secs: i64) -> Option<String> {
    if secs < 0 {
        return None;
    }

    let dt = DateTime::<Utc>::from_timestamp(secs, 0)?;

    Some(dt.format("%Y%m%d%H%M.%S").to_string())
}
