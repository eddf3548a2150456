//! Adapters — concrete implementations of the hexagonal port traits.
//!
//! | Adapter     | Implements        | Connects to                       |
//! |-------------|-------------------|------------------------------------|
//! | `partition` | PartitionPort     | ESP-IDF OTA partitions / `esp-ota` |
//! | `mesh`      | MeshTransportPort | ESP-MESH / in-process simulation   |
//! | `http`      | HttpClientPort    | `esp_idf_svc` HTTP(S) client       |
//! | `nvs`       | KvStorePort       | NVS rollback namespace             |
//! | `time`      | ClockPort         | ESP32 system timer                 |

pub mod http;
pub mod mesh;
pub mod nvs;
pub mod partition;
pub mod time;
