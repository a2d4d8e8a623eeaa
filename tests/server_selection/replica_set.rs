use super::framework::run_dir;

#[test]
fn server_selection_replica_set() {
    run_dir("tests/data/server_selection/replica_set");
}
