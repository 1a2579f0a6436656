//! POSIX shell quoting.
//!
//! Every value interpolated into a remote script goes through [`quote`], including
//! identifiers that were already validated: validation limits what a name may
//! contain, quoting keeps the shell from interpreting what is left.

/// Wraps `value` in single quotes, escaping embedded single quotes as `'\''`.
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// `KEY='value'` suitable for `docker exec -e` or an env prefix.
pub fn quote_env(key: &str, value: &str) -> String {
    format!("{key}={}", quote(value))
}
