use super::framework::run_dir;

#[test]
fn sdam_sharded() {
    run_dir("tests/data/sdam/sharded");
}
