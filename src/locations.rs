//! File-location parsing for the companion SCP client plugin.
//!
//! Arguments take the form `[app[/index]:]file`. A `\:` sequence escapes a
//! literal colon, which keeps Windows-style paths such as `C\:\dir\file`
//! usable as plain local paths.
//!
//! Two parsing quirks are intentional and load-bearing:
//! - a host segment containing two or more `/` is invalid;
//! - a host/index whose index does not parse as an unsigned integer falls
//!   back to "the whole segment is the host, index 0" instead of erroring.
//!   The fallback applies to any non-numeric index, not only escaped-colon
//!   paths, so `app/latest:file` silently targets an app named `app/latest`.

use thiserror::Error;

/// A parsed SCP argument. An empty `app_name` denotes a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub app_name: String,
    pub index: u32,
    pub path: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("invalid host/index format: {0:?}")]
    InvalidHostIndex(String),
    #[error("source and target must be provided")]
    MissingTarget,
}

/// Parse one `[app[/index]:]file` argument.
pub fn parse_location(arg: &str) -> Result<FileLocation, LocationError> {
    let mut location = match split_first_unescaped_colon(arg) {
        Some((host_part, path)) => {
            let (app_name, index) = split_host_index(host_part)?;
            FileLocation {
                app_name: app_name.to_string(),
                index,
                path: path.to_string(),
            }
        }
        None => FileLocation {
            app_name: String::new(),
            index: 0,
            path: arg.to_string(),
        },
    };

    location.path = location.path.replace("\\:", ":");
    Ok(location)
}

/// Parse a full argument list: the first N-1 entries are sources, the last
/// is the target.
pub fn parse_locations(args: &[String]) -> Result<(Vec<FileLocation>, FileLocation), LocationError> {
    if args.len() < 2 {
        return Err(LocationError::MissingTarget);
    }

    let mut locations = args
        .iter()
        .map(|arg| parse_location(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let target = locations.pop().ok_or(LocationError::MissingTarget)?;
    Ok((locations, target))
}

/// Split at the first colon not preceded by a backslash. A colon at position
/// zero never splits; `:file` is a local path.
fn split_first_unescaped_colon(arg: &str) -> Option<(&str, &str)> {
    let bytes = arg.as_bytes();
    for i in 1..bytes.len() {
        if bytes[i] == b':' && bytes[i - 1] != b'\\' {
            return Some((&arg[..i], &arg[i + 1..]));
        }
    }
    None
}

fn split_host_index(segment: &str) -> Result<(&str, u32), LocationError> {
    let parts: Vec<&str> = segment.split('/').collect();
    match parts.len() {
        1 => Ok((segment, 0)),
        2 => match parts[1].parse::<u32>() {
            Ok(index) => Ok((parts[0], index)),
            // Non-numeric index: treat the whole segment as the host.
            Err(_) => Ok((segment, 0)),
        },
        _ => Err(LocationError::InvalidHostIndex(segment.to_string())),
    }
}
