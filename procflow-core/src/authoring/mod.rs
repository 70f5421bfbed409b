//! YAML authoring surface: a serde DTO for process models, structural
//! validation, and conversion into `ExecutableProcessModel`.

pub mod dto;
pub mod dto_to_model;
pub mod validate;
pub mod yaml;

pub use dto::{EdgeDto, ModelMeta, NodeDto, ProcessModelDto};
pub use dto_to_model::dto_to_model;
pub use validate::{validate_dto, ValidationError};
pub use yaml::parse_process_yaml;
