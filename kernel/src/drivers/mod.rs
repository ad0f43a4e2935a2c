pub mod dummy_device;
pub mod ram_disk;
