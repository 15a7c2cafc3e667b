use crate::models::{DeviceStatusTable, SensorReadingTable, Table};

pub struct SchemaManager {
    tables: Vec<Box<dyn Table>>,
}

impl SchemaManager {
    pub fn new(tables: Vec<Box<dyn Table>>) -> Self {
        Self { tables }
    }

    pub fn table_names(&self) -> Vec<&'static str> {
        self.tables.iter().map(|table| table.name()).collect()
    }

    pub fn create_schema(&self) -> Vec<String> {
        self.tables.iter().map(|table| table.create()).collect()
    }

    pub fn dispose_schema(&self) -> Vec<String> {
        self.tables.iter().rev().map(|table| table.dispose()).collect()
    }
}

impl Default for SchemaManager {
    fn default() -> Self {
        SchemaManager::new(vec![Box::new(SensorReadingTable), Box::new(DeviceStatusTable)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispose_in_reverse_order() {
        let manager = SchemaManager::default();

        assert_eq!(manager.table_names(), vec!["sensor_readings", "device_status"]);

        let dispose = manager.dispose_schema();
        assert_eq!(dispose[0], "DROP TABLE IF EXISTS device_status;");
        assert_eq!(dispose[1], "DROP TABLE IF EXISTS sensor_readings;");
    }

    #[test]
    fn test_create_statements_carry_indexes() {
        let create = SchemaManager::default().create_schema().join("\n");

        assert!(create.contains("idx_sensor_readings_device_time"));
        assert!(create.contains("idx_device_status_device_time"));
    }
}
