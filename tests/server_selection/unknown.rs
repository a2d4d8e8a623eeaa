use super::framework::run_dir;

#[test]
fn server_selection_unknown() {
    run_dir("tests/data/server_selection/unknown");
}
