use convprop_api::{BuildOptions, ConvError, Result};

const WORKGROUP_PLACEHOLDER: &str = "@WG@";

#[derive(Clone, Copy)]
struct Branch {
    /// Every enclosing block is active.
    parent_active: bool,
    /// Some branch of this block has already been taken.
    taken: bool,
    active: bool,
    seen_else: bool,
}

/// Resolve `#ifdef` / `#ifndef` / `#elif` / `#else` / `#endif` blocks against
/// the defines in `options`. Directive lines are dropped; inactive lines are
/// replaced by empty lines so diagnostics keep their line numbers.
pub fn preprocess(
    source: &str,
    options: &BuildOptions,
    kernel_name: &str,
    source_label: &str,
) -> Result<String> {
    let fail = |line_no: usize, message: &str| {
        ConvError::build(
            kernel_name,
            &options.to_string(),
            format!("{source_label}:{line_no}: {message}"),
        )
    };

    let mut stack: Vec<Branch> = Vec::new();
    let mut out = String::with_capacity(source.len());

    for (idx, line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim_start();
        let active = stack.last().map(|b| b.active).unwrap_or(true);

        if let Some(directive) = trimmed.strip_prefix('#') {
            let mut parts = directive.split_whitespace();
            let keyword = parts.next().unwrap_or("");
            match keyword {
                "ifdef" | "ifndef" => {
                    let name = parts
                        .next()
                        .ok_or_else(|| fail(line_no, "missing define name"))?;
                    let defined = options.is_defined(name);
                    let cond = if keyword == "ifdef" { defined } else { !defined };
                    stack.push(Branch {
                        parent_active: active,
                        taken: cond,
                        active: active && cond,
                        seen_else: false,
                    });
                }
                "elif" => {
                    let mut name = parts
                        .next()
                        .ok_or_else(|| fail(line_no, "missing #elif condition"))?;
                    if name == "defined" {
                        name = parts
                            .next()
                            .ok_or_else(|| fail(line_no, "missing define name"))?;
                    }
                    let name = name.trim_start_matches('(').trim_end_matches(')');
                    let top = stack
                        .last_mut()
                        .ok_or_else(|| fail(line_no, "#elif without #ifdef"))?;
                    if top.seen_else {
                        return Err(fail(line_no, "#elif after #else"));
                    }
                    let cond = !top.taken && options.is_defined(name);
                    top.taken |= cond;
                    top.active = top.parent_active && cond;
                }
                "else" => {
                    let top = stack
                        .last_mut()
                        .ok_or_else(|| fail(line_no, "#else without #ifdef"))?;
                    if top.seen_else {
                        return Err(fail(line_no, "duplicate #else"));
                    }
                    top.seen_else = true;
                    top.active = top.parent_active && !top.taken;
                    top.taken = true;
                }
                "endif" => {
                    stack
                        .pop()
                        .ok_or_else(|| fail(line_no, "#endif without #ifdef"))?;
                }
                other => {
                    return Err(fail(line_no, &format!("unsupported directive '#{other}'")));
                }
            }
            out.push('\n');
            continue;
        }

        if active {
            out.push_str(line);
        }
        out.push('\n');
    }

    if !stack.is_empty() {
        return Err(fail(
            source.lines().count(),
            "unterminated #ifdef block at end of source",
        ));
    }
    Ok(out)
}

/// Substitute the workgroup-size placeholder for one pipeline variant.
pub fn specialize_workgroup(source: &str, workgroup_size: u32) -> String {
    source.replace(WORKGROUP_PLACEHOLDER, &workgroup_size.to_string())
}

/// True when the (preprocessed) source still declares `fn <kernel_name>(`.
pub fn declares_entry_point(source: &str, kernel_name: &str) -> bool {
    source.lines().any(|line| {
        line.trim_start()
            .strip_prefix("fn ")
            .and_then(|rest| rest.trim_start().strip_prefix(kernel_name))
            .map(|rest| rest.trim_start().starts_with('('))
            .unwrap_or(false)
    })
}
