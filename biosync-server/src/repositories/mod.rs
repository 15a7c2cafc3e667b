mod device_status;
mod sensor_reading;

pub use device_status::{DeviceStatusRepository, StatusWrite};
pub use sensor_reading::{DEFAULT_CHANNELS, DEFAULT_RECENT_WINDOW_MINUTES, SensorReadingRepository};
