mod framework;
mod sharded;
mod single;
