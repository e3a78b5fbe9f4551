// tests/ingest_normalize.rs
use dugtrio_trends::ingest::normalize_text;

#[test]
fn blank_post_normalizes_to_empty() {
    assert_eq!(normalize_text(" \n\t "), "");
}

#[test]
fn cashtags_emoji_and_punctuation_survive() {
    let s = "$SOL &gt; $ETH 🚀🚀 !!!";
    assert_eq!(normalize_text(s), "$SOL > $ETH 🚀🚀 !!!");
}

#[test]
fn multiline_thread_collapses_to_one_line() {
    let s = "gm\n\nSOL\u{00A0}szn\r\n  lfg";
    assert_eq!(normalize_text(s), "gm SOL szn lfg");
}

#[test]
fn length_cap_counts_chars_not_bytes() {
    let s = "🚀".repeat(2_000);
    assert_eq!(normalize_text(&s).chars().count(), 1_500);
}
