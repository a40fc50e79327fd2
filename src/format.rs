use std::borrow::Cow;

/// Make a string safe to hand to a printf-style sink.
///
/// Every `%` is doubled. With `need_newline` set, a single `\n` is appended
/// unless the string already ends in one. When nothing needs changing the
/// input is returned borrowed, without allocating.
pub fn format_safe(s: &str, need_newline: bool) -> Cow<'_, str> {
    let percent_count = s.bytes().filter(|&b| b == b'%').count();
    let add_newline = need_newline && !s.ends_with('\n');

    if percent_count == 0 && !add_newline {
        return Cow::Borrowed(s);
    }

    let capacity = s
        .len()
        .saturating_add(percent_count)
        .saturating_add(usize::from(add_newline));
    let mut out = String::with_capacity(capacity);
    for ch in s.chars() {
        out.push(ch);
        if ch == '%' {
            out.push('%');
        }
    }
    if add_newline {
        out.push('\n');
    }
    Cow::Owned(out)
}

/// Newline-terminate a line without escaping it.
pub fn terminate_line(s: &str) -> Cow<'_, str> {
    if s.ends_with('\n') {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("{s}\n"))
    }
}

/// Render a printf format string that carries no arguments, the way a
/// printf-style sink would print it: `%%` collapses to `%`, anything else
/// is copied through.
pub fn render_format(format: &str) -> Cow<'_, str> {
    if !format.contains("%%") {
        return Cow::Borrowed(format);
    }

    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    while let Some(ch) = chars.next() {
        out.push(ch);
        if ch == '%' && chars.peek() == Some(&'%') {
            chars.next();
        }
    }
    Cow::Owned(out)
}
