mod device_status;
mod sensor_reading;

pub use device_status::{DeviceStatusRecord, DeviceStatusTable};
pub use sensor_reading::{ReadingSample, SensorReadingRecord, SensorReadingTable};

pub trait Table {
    /// The name of the table
    fn name(&self) -> &'static str;

    /// The SQL statements to create the table and its indexes
    fn create(&self) -> String;

    /// The SQL statement to dispose the table
    fn dispose(&self) -> String;
}
