// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

#![no_main]

use libfuzzer_sys::fuzz_target;
use regression_analyser::dedup::dedup_failures;
use regression_analyser::report::{parse_report, CucumberParser, ReportParser};

fuzz_target!(|data: &[u8]| {
    if let Ok(features) = parse_report(data) {
        let failures = CucumberParser::new().failures(&features);
        let total = failures.len();
        let unique = dedup_failures(failures);
        assert_eq!(unique.iter().map(|u| u.occurrences).sum::<usize>(), total);
    }
});
