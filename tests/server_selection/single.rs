use super::framework::run_dir;

#[test]
fn server_selection_single() {
    run_dir("tests/data/server_selection/single");
}
