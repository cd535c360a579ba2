pub mod align;
pub mod binary_xml;
pub mod manifest;
pub mod zip;
