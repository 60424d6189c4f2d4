//! Branch name to worktree-directory-name slugification (W-Create step 1).

/// Lowercases `branch_name`, replaces any character outside `[a-z0-9/._-]`
/// with `-`, collapses consecutive `-`, trims `-` at both ends, then replaces
/// `/` with `-` so the result is safe to use as a single path component.
///
/// Idempotent: `slugify(slugify(b)) == slugify(b)`.
#[must_use]
pub fn slugify(branch_name: &str) -> String {
    let lowered = branch_name.to_lowercase();

    let mut replaced = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '/' | '.' | '_' | '-') {
            replaced.push(c);
        } else {
            replaced.push('-');
        }
    }

    let collapsed = collapse_dashes(&replaced);
    let trimmed = collapsed.trim_matches('-');
    trimmed.replace('/', "-")
}

fn collapse_dashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_dash = false;
    for c in s.chars() {
        if c == '-' {
            if !last_was_dash {
                out.push(c);
            }
            last_was_dash = true;
        } else {
            out.push(c);
            last_was_dash = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_replaces_slashes() {
        assert_eq!(slugify("feat/Login"), "feat-login");
    }

    #[test]
    fn collapses_runs_of_invalid_chars() {
        assert_eq!(slugify("feat//weird!!name"), "feat-weird-name");
    }

    #[test]
    fn trims_leading_trailing_dashes() {
        assert_eq!(slugify("--feat--"), "feat");
    }

    #[test]
    fn is_idempotent() {
        let cases = ["feat/login", "Fix/Bug #123", "___", "a/b/c.d-e_f"];
        for c in cases {
            let once = slugify(c);
            let twice = slugify(&once);
            assert_eq!(once, twice, "not idempotent for {c:?}");
        }
    }

}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn slugify_is_idempotent(s in ".{0,64}") {
            let once = slugify(&s);
            let twice = slugify(&once);
            prop_assert_eq!(once, twice);
        }

        /// Output never contains a raw `/` (it's folded into `-`) and never
        /// starts or ends with `-`, for any input.
        #[test]
        fn slugify_output_has_no_slash_or_edge_dashes(s in "[ -~]{0,64}") {
            let slug = slugify(&s);
            prop_assert!(!slug.contains('/'));
            prop_assert!(!slug.starts_with('-') && !slug.ends_with('-'));
        }
    }
}
