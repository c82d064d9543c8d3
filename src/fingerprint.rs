use regex::Regex;
use std::sync::LazyLock;

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

static EMPHASIS_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[*_`~]").expect("emphasis regex"));

static EMOJI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        "[",
        "\u{1F600}-\u{1F64F}",
        "\u{1F300}-\u{1F5FF}",
        "\u{1F680}-\u{1F6FF}",
        "\u{1F1E0}-\u{1F1FF}",
        "\u{1F900}-\u{1F9FF}",
        "\u{1FA70}-\u{1FAFF}",
        "\u{2600}-\u{26FF}",
        "\u{2700}-\u{27BF}",
        "\u{FE0F}",
        "\u{200D}",
        "]"
    ))
    .expect("emoji regex")
});

static TOOL_MARKUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_use>.*?</tool_use>|<tool_call>.*?</tool_call>")
        .expect("tool markup regex")
});

/// Canonical form of an assistant reply used as a thread lookup key.
///
/// Decodes HTML entities, collapses whitespace, drops markdown emphasis
/// characters and emoji. Case is preserved. The pass is repeated until the
/// text stops changing, so `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(text: &str) -> String {
    let mut current = normalize_pass(text);
    // a changing pass never grows the text, so this reaches a fixed point
    loop {
        let next = normalize_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn normalize_pass(text: &str) -> String {
    let decoded = html_escape::decode_html_entities(text);
    let collapsed = collapse_whitespace(&decoded);
    let stripped = EMPHASIS_CHARS.replace_all(&collapsed, "");
    let stripped = EMOJI.replace_all(&stripped, "");
    // removals can leave adjacent spaces behind
    collapse_whitespace(&stripped)
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RUN.replace_all(text, " ").trim().to_string()
}

/// Removes every `<tool_use>` / `<tool_call>` span, including multi-line ones.
pub fn strip_tool_markup(text: &str) -> String {
    TOOL_MARKUP.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_trims() {
        assert_eq!(normalize("  hello \n\t  world  "), "hello world");
    }

    #[test]
    fn drops_emphasis_characters() {
        assert_eq!(normalize("**bold** _it_ `code` ~~gone~~"), "bold it code gone");
    }

    #[test]
    fn decodes_html_entities() {
        assert_eq!(normalize("a &amp; b &lt;c&gt; &#39;d&#39;"), "a & b <c> 'd'");
    }

    #[test]
    fn removes_emoji() {
        assert_eq!(normalize("done \u{1F600} \u{2705} ok \u{1F680}"), "done ok");
    }

    #[test]
    fn keeps_case_and_cjk() {
        assert_eq!(normalize("Hello 你好"), "Hello 你好");
        assert_ne!(normalize("Hello"), normalize("hello"));
    }

    #[test]
    fn is_idempotent_on_tricky_input() {
        let inputs = [
            "a * b",
            "&amp;lt;tag&amp;gt;",
            "&am*p; and \u{1F600}  x",
            "  _ _ _  ",
            "line one\r\n\r\nline two",
            "",
        ];
        for input in inputs {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn deeply_nested_entities_fully_decode() {
        let nested = format!("&{}lt;b", "amp;".repeat(24));
        assert_eq!(normalize(&nested), "<b");
        assert_eq!(normalize(&normalize(&nested)), "<b");
    }

    #[test]
    fn empty_and_all_removed_input_is_empty() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize(" ** ~~ \u{1F600} "), "");
    }

    #[test]
    fn strips_tool_markup() {
        assert_eq!(strip_tool_markup("<tool_use>X</tool_use>hello"), "hello");
        assert_eq!(
            strip_tool_markup("a<tool_call>{\n\"name\": \"f\"\n}</tool_call>b<tool_use>y</tool_use>c"),
            "abc"
        );
        assert_eq!(strip_tool_markup("no markup"), "no markup");
    }
}
