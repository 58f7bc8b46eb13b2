mod embedded_storage;

pub use embedded_storage::NorFlashAdapter;
