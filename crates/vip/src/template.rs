//! Command template expansion.

use common::{Error, Result};

/// Placeholder replaced by the delegate IP in interface commands.
pub const IP_PLACEHOLDER: &str = "$_IP_$";

/// Replace every occurrence of each placeholder in one left to right pass.
///
/// Substituted values are never scanned again.
pub fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    'scan: while !rest.is_empty() {
        for (placeholder, value) in values {
            if !placeholder.is_empty() && rest.starts_with(placeholder) {
                out.push_str(value);
                rest = &rest[placeholder.len()..];
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }

    out
}

/// Expand `%h` to `host` and `%%` to `%`. Other `%` sequences are dropped.
pub fn expand_percent(template: &str, host: &str) -> String {
    let mut out = String::with_capacity(template.len() + host.len());
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(host),
            Some('%') => out.push('%'),
            _ => {}
        }
    }

    out
}

/// Split a command line on runs of spaces.
pub fn split_command(cmd: &str) -> Vec<String> {
    cmd.split(' ')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build the argv of an interface command.
///
/// `$_IP_$` is replaced by `ip`, the result split on spaces, and the first
/// token joined to `base_dir` unless it is already an absolute path.
pub fn resolve_command(template: &str, base_dir: &str, ip: &str) -> Result<Vec<String>> {
    let expanded = substitute(template, &[(IP_PLACEHOLDER, ip)]);
    let mut argv = split_command(&expanded);

    let Some(program) = argv.first_mut() else {
        return Err(Error::config(format!("unable to parse the command \"{}\"", template)));
    };

    if !program.starts_with('/') {
        *program = format!("{}/{}", base_dir.trim_end_matches('/'), program);
    }

    Ok(argv)
}
