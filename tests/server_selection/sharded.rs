use super::framework::run_dir;

#[test]
fn server_selection_sharded() {
    run_dir("tests/data/server_selection/sharded");
}
