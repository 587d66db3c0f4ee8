// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use regression_analyser::chain::create_batches;
use regression_analyser::output::parse_analyses;

#[derive(Arbitrary, Debug)]
struct Input<'a> {
    response: &'a str,
    sizes: Vec<u16>,
    max_chars: u16,
    max_items: u8,
}

fuzz_target!(|input: Input<'_>| {
    let _ = parse_analyses(input.response);

    let total = input.sizes.len();
    let batches = create_batches(input.sizes, |n| *n as usize, input.max_chars as usize, input.max_items as usize);
    let batched: usize = batches.batches.iter().map(Vec::len).sum();
    assert_eq!(batched + batches.dropped.len(), total);
});
