pub mod exec_record;
pub mod procfs;
