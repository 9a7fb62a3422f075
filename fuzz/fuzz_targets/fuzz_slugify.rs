#![no_main]

use libfuzzer_sys::fuzz_target;
use rt_expr::reserved_words;
use rt_frame::slugify_columns;

fuzz_target!(|labels: Vec<String>| {
    let reserved = reserved_words();
    let slugs = slugify_columns(&labels, &reserved);
    assert_eq!(slugs.len(), labels.len());
    // Slugs are pairwise unique and never shadow a reserved word.
    for (i, slug) in slugs.iter().enumerate() {
        assert!(!reserved.contains(&slug.as_str()));
        assert!(!slugs[..i].contains(slug));
    }
});
