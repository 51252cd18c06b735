use crate::ir::{CallTarget, MethodKey};

const CONSTRUCTOR_PREFIX: &str = "\"<init>\"";

/// Decode a javap-style call annotation such as
/// `// Method java/util/Calendar.getInstance:()Ljava/util/Calendar;`.
///
/// An annotation without an owner resolves to `context_class` for
/// constructors and to an unresolved target otherwise. Returns `None`
/// when the comment is not a method reference.
pub(crate) fn parse_call_comment(comment: &str, context_class: &str) -> Option<CallTarget> {
    let rest = comment.trim_start().strip_prefix("//")?.trim_start();
    let rest = rest.strip_prefix("Interface").unwrap_or(rest);
    let name = rest.strip_prefix("Method")?;
    if !name.starts_with(char::is_whitespace) {
        return None;
    }
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    match split_class_method(name) {
        Some(key) => Some(CallTarget::new(Some(&key.class), &key.method)),
        None if name.starts_with(CONSTRUCTOR_PREFIX) => {
            Some(CallTarget::new(Some(context_class), name))
        }
        None => Some(CallTarget::new(None, name)),
    }
}

/// Split `owner.name:desc` at the first `.`.
pub(crate) fn split_class_method(signature: &str) -> Option<MethodKey> {
    let (class, method) = signature.split_once('.')?;
    Some(MethodKey::new(class, method))
}

/// Count the declared parameters of a `name:(args)ret` signature.
/// Array dimensions do not add parameters; `long`/`double` count once.
pub(crate) fn count_method_args(signature: &str) -> Result<usize, String> {
    let start = signature
        .find(":(")
        .ok_or_else(|| format!("missing parameter list in {signature}"))?;
    let params = &signature[start + 2..];
    let end = params
        .find(')')
        .ok_or_else(|| format!("unterminated parameter list in {signature}"))?;
    let params = params[..end].replace('[', "");

    let mut count = 0;
    let mut chars = params.chars();
    while let Some(c) = chars.next() {
        match c {
            'V' | 'Z' | 'B' | 'C' | 'S' | 'I' | 'J' | 'F' | 'D' => count += 1,
            'L' => {
                count += 1;
                if !chars.by_ref().any(|c| c == ';') {
                    return Err(format!("unterminated class type in {signature}"));
                }
            }
            other => return Err(format!("unexpected descriptor char '{other}' in {signature}")),
        }
    }
    Ok(count)
}

pub(crate) fn is_constructor(method: &str) -> bool {
    method.starts_with(CONSTRUCTOR_PREFIX) || method.starts_with("access$")
}

/// Location string of a program point: `class.method,index`.
pub(crate) fn format_location(key: &MethodKey, index: usize) -> String {
    format!("{}.{},{}", key.class, key.method, index)
}

/// Parse `class.method,index` with an optional trailing ` >depth`.
pub(crate) fn parse_location(text: &str) -> Option<(MethodKey, usize)> {
    // `"<init>"` carries its own '>', so only a numeric tail is a depth.
    let text = match text.rsplit_once('>') {
        Some((head, depth)) if depth.trim().parse::<usize>().is_ok() => head,
        _ => text,
    };
    let (sig, index) = text.trim().rsplit_once(',')?;
    let index = index.trim().parse().ok()?;
    let key = split_class_method(sig.trim())?;
    Some((key, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_call_comment_reads_owner_and_signature() {
        let target = parse_call_comment(
            "// Method java/util/Calendar.getInstance:()Ljava/util/Calendar;",
            "Ctx",
        )
        .expect("target");
        assert_eq!(Some("java/util/Calendar".to_string()), target.class);
        assert_eq!("getInstance:()Ljava/util/Calendar;", target.method);

        let target = parse_call_comment("// InterfaceMethod java/util/List.size:()I", "Ctx")
            .expect("interface target");
        assert_eq!(Some("java/util/List".to_string()), target.class);
    }

    #[test]
    fn parse_call_comment_without_owner() {
        let target = parse_call_comment("// Method foo:()V", "Ctx").expect("target");
        assert_eq!(CallTarget::new(None, "foo:()V"), target);

        let target = parse_call_comment("// Method \"<init>\":()V", "Ctx").expect("ctor");
        assert_eq!(CallTarget::new(Some("Ctx"), "\"<init>\":()V"), target);

        assert!(parse_call_comment("// Field out:Ljava/io/PrintStream;", "Ctx").is_none());
        assert!(parse_call_comment("// Methodical", "Ctx").is_none());
    }

    #[test]
    fn count_method_args_handles_arrays_and_objects() {
        assert_eq!(Ok(0), count_method_args("run:()V"));
        assert_eq!(
            Ok(3),
            count_method_args("set:(Ljava/util/Calendar;[[ILjava/lang/String;)V")
        );
        assert_eq!(Ok(2), count_method_args("m:(JD)V"));
        assert!(count_method_args("broken").is_err());
        assert!(count_method_args("m:(Ljava/lang/String)V").is_err());
    }

    #[test]
    fn location_round_trips_with_depth_suffix() {
        let key = MethodKey::new("a/B", "m:(I)V");
        let text = format!("{} >2", format_location(&key, 14));

        assert_eq!(Some((key, 14)), parse_location(&text));
        assert_eq!(
            Some((MethodKey::new("a/B", "\"<init>\":()V"), 1)),
            parse_location("a/B.\"<init>\":()V,1")
        );
        assert!(parse_location("no-index").is_none());
    }
}
