pub mod correction_engine;
pub mod data_matcher;
pub mod field_extractor;
pub mod form_filler;
pub mod master_data;
