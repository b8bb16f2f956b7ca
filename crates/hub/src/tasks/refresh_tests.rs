// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn refresh_fires_at_eighty_percent() {
    assert_eq!(refresh_interval(Duration::from_secs(900)), Duration::from_secs(720));
}

#[test]
fn refresh_interval_has_a_floor() {
    assert_eq!(refresh_interval(Duration::from_millis(100)), Duration::from_secs(1));
}
