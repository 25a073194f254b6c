#![no_main]

use issuebot_session::{parse_issue_arguments, render_issue_arguments};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    match parse_issue_arguments(&raw) {
        Ok(parsed) => {
            let rendered = render_issue_arguments(&parsed);
            let reparsed = parse_issue_arguments(&rendered).expect("rendered arguments reparse");
            assert_eq!(reparsed, parsed);
        }
        Err(error) => {
            assert!(!error.reason().as_str().is_empty());
        }
    }
});
