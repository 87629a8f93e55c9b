use memchr::memmem;
use regex::Regex;

/// Replace all occurrences of `from` with `to` in `input`.
///
/// This function is optimized for the case where no replacements are made.
///
/// # Arguments
///
/// * `input` - The input string to search for replacements.
/// * `from` - The `Finder` to search for. Must be created from valid UTF-8.
/// * `to` - The string to replace `from` with.
/// * `scratch_buffer` - A buffer to store the result in. Is expected to be empty.
/// * `did_replace` - Set to whether at least one replacement was made.
///
/// # Returns
///
/// A tuple containing the modified `input` and the `clear`ed `scratch_buffer`.
///
/// # Panics
///
/// Might panic if `from` is not valid UTF-8.
pub(crate) fn str_replace_opt(
    mut input: String,
    from: &memmem::Finder,
    to: &str,
    scratch_buffer: String,
    did_replace: &mut bool,
) -> (String, String) {
    let mut result = scratch_buffer;
    let mut last_end = 0;
    let mut replaced = false;
    for start in from.find_iter(input.as_bytes()) {
        let end = start + from.needle().len();

        // string indexing could panic if the Finder is not valid UTF-8
        result.push_str(&input[last_end..start]);
        result.push_str(to);

        last_end = end;
        replaced = true;
    }

    *did_replace = replaced;
    if !replaced {
        // no need to clear the scratch buffer, since it's already empty
        (input, result)
    } else {
        // copy the remaining text
        result.push_str(&input[last_end..]);

        input.clear();
        (result, input)
    }
}

/// Find all `regex` matches in `input` and replace them with the result of `replacement`.
///
/// Same contract as [`str_replace_opt`]: the untouched `input` is handed back without copying
/// when there is no match, and `did_replace` tells the caller whether anything changed.
pub(crate) fn regex_replace_opt<R: regex::Replacer>(
    mut input: String,
    regex: &Regex,
    mut replacement: R,
    scratch_buffer: String,
    did_replace: &mut bool,
) -> (String, String) {
    let mut capt_iter = regex.captures_iter(&input).peekable();

    if capt_iter.peek().is_none() {
        *did_replace = false;
        (input, scratch_buffer)
    } else {
        let mut result = scratch_buffer;
        let mut last_end = 0;
        for cap in capt_iter {
            let Some(m) = cap.get(0) else { continue };

            result.push_str(&input[last_end..m.start()]);
            replacement.replace_append(&cap, &mut result);

            last_end = m.end();
        }

        // copy the remaining text
        result.push_str(&input[last_end..]);

        // a replacement can reproduce the matched text verbatim
        *did_replace = result != input;

        input.clear();
        (result, input)
    }
}

fn trim_end_in_place(s: &mut String) {
    let trimmed = s.trim_end();
    s.truncate(trimmed.len());
}

fn trim_start_in_place(s: &mut String) {
    let trimmed = s.trim_start();
    s.replace_range(..(s.len() - trimmed.len()), "");
}

pub(crate) fn trim_in_place(mut input: String) -> String {
    trim_end_in_place(&mut input);
    trim_start_in_place(&mut input);
    input
}
