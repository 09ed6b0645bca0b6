//! Every rename, move and delete, made on either side, by either agent,
//! with and without the syncing agent paused.

mod common;

use common::{agent, login, setup, WINDOW};
use twoway_harness::symmetry::SYMMETRY_ROOT;
use twoway_harness::{run_symmetry_cases, CaseParams, SymmetryAgents};

#[test]
fn two_way_high_level_symmetries() {
    let (_root, context) = setup();
    let steady = agent(&context, "steady");
    let resume = agent(&context, "resume");
    let other = agent(&context, "other");

    steady
        .login_reset_make_remote_nodes(SYMMETRY_ROOT, 0, 0)
        .unwrap();
    login(&resume);
    login(&other);

    let cases = CaseParams::enumerate();
    let summary = run_symmetry_cases(
        SymmetryAgents {
            steady: &steady,
            resume: &resume,
            other: &other,
        },
        &cases,
        WINDOW,
    )
    .unwrap();

    assert_eq!(summary.total(), 60);
    assert!(summary.all_passed(), "{}", summary);
}
