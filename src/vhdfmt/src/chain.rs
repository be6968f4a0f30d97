//! Parent locators and differencing-chain resolution.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::ondisk::{vhd_time_now, DiskType, ParentLocator, PlatCode};
use crate::{OpenFlags, Result, VhdContext, VhdError, TIMESTAMP_MAX_SLACK};

/// Encode a path as a MACX locator: a `file://` URL in UTF-8.
pub fn macx_encode(path: &str) -> Vec<u8> {
    format!("file://{path}").into_bytes()
}

pub fn macx_decode(data: &[u8]) -> Result<String> {
    let s = std::str::from_utf8(data)
        .map_err(|_| VhdError::invalid("parent locator", "MACX data is not UTF-8"))?;
    let s = s.trim_end_matches('\0');
    s.strip_prefix("file://")
        .map(str::to_owned)
        .ok_or_else(|| VhdError::invalid("parent locator", format!("bad MACX locator {s:?}")))
}

/// Encode a path as a W2KU/W2RU locator: UTF-16LE, backslashes, and a drive
/// prefix for absolute paths.
pub fn w2u_encode(path: &str) -> Vec<u8> {
    let windows = if let Some(rest) = path.strip_prefix('/') {
        format!("c:\\{}", rest.replace('/', "\\"))
    } else {
        path.replace('/', "\\")
    };

    let mut out = Vec::with_capacity(windows.len() * 2);
    for unit in windows.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

pub fn w2u_decode(data: &[u8]) -> Result<String> {
    let mut le = true;
    let mut start = 0;
    if data.len() >= 2 {
        if data[0] == 0xff && data[1] == 0xfe {
            start = 2;
        } else if data[0] == 0xfe && data[1] == 0xff {
            le = false;
            start = 2;
        }
    }

    let mut units = Vec::with_capacity(data.len() / 2);
    for pair in data[start..].chunks_exact(2) {
        let unit = if le {
            u16::from_le_bytes([pair[0], pair[1]])
        } else {
            u16::from_be_bytes([pair[0], pair[1]])
        };
        if unit == 0 {
            break;
        }
        units.push(unit);
    }

    let s = String::from_utf16(&units)
        .map_err(|_| VhdError::invalid("parent locator", "undecodable UTF-16 data"))?;

    let mut path = s.replace('\\', "/");
    let lower = path.to_ascii_lowercase();
    if let Some(rest) = lower.strip_prefix("c:") {
        path = path[path.len() - rest.len()..].to_string();
    }

    Ok(path)
}

/// Decode a locator's payload into a UTF-8 path string.
pub fn decode_locator(ctx: &VhdContext, loc: &ParentLocator) -> Result<String> {
    let data = ctx.read_locator_data(loc)?;
    match loc.code {
        PlatCode::MACX => macx_decode(&data),
        PlatCode::W2KU | PlatCode::W2RU => w2u_decode(&data),
        code => Err(VhdError::invalid(
            "parent locator",
            format!("unsupported platform code {}", code.name()),
        )),
    }
}

/// Resolve a (possibly relative) decoded parent path against the child's
/// directory.
pub fn resolve_parent_path(child: &Path, decoded: &str) -> PathBuf {
    let p = Path::new(decoded);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        child
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(decoded)
    }
}

/// Find this image's parent by probing locators in slot order.
///
/// Returns `NoParent` for non-differencing images.
pub fn parent_path(ctx: &VhdContext) -> Result<PathBuf> {
    if ctx.footer.disk_type != DiskType::Diff {
        return Err(VhdError::NoParent);
    }

    let mut last_err = None;
    for loc in &ctx.header.loc {
        if !matches!(loc.code, PlatCode::MACX | PlatCode::W2KU | PlatCode::W2RU) {
            continue;
        }

        match decode_locator(ctx, loc) {
            Ok(decoded) => {
                let candidate = resolve_parent_path(ctx.path(), &decoded);
                if candidate.exists() {
                    debug!(parent = %candidate.display(), code = loc.code.name(), "resolved parent");
                    return Ok(candidate);
                }
                last_err = Some(VhdError::invalid(
                    "parent locator",
                    format!("parent {} does not exist", candidate.display()),
                ));
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err
        .unwrap_or_else(|| VhdError::invalid("parent locator", "no usable parent locator")))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOpts {
    pub ignore_parent_uuid: bool,
    pub ignore_timestamps: bool,
}

/// Verify that `parent` really is the image `child` was snapshotted from.
pub fn validate_parent(
    child: &VhdContext,
    parent: &VhdContext,
    opts: ValidateOpts,
) -> Result<()> {
    if !opts.ignore_parent_uuid && child.header.prt_uuid != parent.footer.uuid {
        return Err(VhdError::invalid("chain", "parent uuid mismatch"));
    }

    if !opts.ignore_timestamps && child.header.prt_ts > vhd_time_now() + TIMESTAMP_MAX_SLACK {
        return Err(VhdError::invalid("chain", "parent timestamp in future"));
    }

    Ok(())
}

/// Open an image and its ancestors, child first. Parents open read-only.
pub fn open_chain(
    path: impl AsRef<Path>,
    flags: OpenFlags,
    opts: ValidateOpts,
) -> Result<Vec<VhdContext>> {
    let mut chain = vec![VhdContext::open(path.as_ref(), flags)?];
    let mut seen: HashSet<Uuid> = HashSet::new();
    seen.insert(chain[0].footer.uuid);

    while chain.last().unwrap().footer.disk_type == DiskType::Diff {
        let child = chain.last().unwrap();
        let ppath = parent_path(child)?;

        let pflags =
            (flags & (OpenFlags::QUIET | OpenFlags::CACHED | OpenFlags::FAST)) | OpenFlags::RDONLY;
        let parent = VhdContext::open(&ppath, pflags)?;

        if !seen.insert(parent.footer.uuid) {
            return Err(VhdError::invalid("chain", "cyclical parent chain"));
        }

        validate_parent(child, &parent, opts)?;
        chain.push(parent);
    }

    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macx_round_trip() {
        let data = macx_encode("/images/parent.vhd");
        assert_eq!(data, b"file:///images/parent.vhd");
        assert_eq!(macx_decode(&data).unwrap(), "/images/parent.vhd");
        assert!(macx_decode(b"/images/parent.vhd").is_err());
    }

    #[test]
    fn w2u_round_trip() {
        let data = w2u_encode("/images/parent.vhd");
        let back = w2u_decode(&data).unwrap();
        assert_eq!(back, "/images/parent.vhd");

        let rel = w2u_encode("parent.vhd");
        assert_eq!(w2u_decode(&rel).unwrap(), "parent.vhd");
    }

    #[test]
    fn w2u_decode_handles_boms() {
        // "c:\p" little-endian with BOM
        let mut le = vec![0xff, 0xfe];
        for unit in "c:\\p".encode_utf16() {
            le.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(w2u_decode(&le).unwrap(), "/p");

        let mut be = vec![0xfe, 0xff];
        for unit in "c:\\p".encode_utf16() {
            be.extend_from_slice(&unit.to_be_bytes());
        }
        assert_eq!(w2u_decode(&be).unwrap(), "/p");
    }

    #[test]
    fn relative_paths_resolve_against_child_dir() {
        let resolved = resolve_parent_path(Path::new("/images/child.vhd"), "parent.vhd");
        assert_eq!(resolved, Path::new("/images/parent.vhd"));

        let abs = resolve_parent_path(Path::new("/images/child.vhd"), "/other/parent.vhd");
        assert_eq!(abs, Path::new("/other/parent.vhd"));
    }
}
