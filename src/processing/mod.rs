pub mod chunker;
pub mod lopdf_parser;
pub mod parser;
pub mod type_detector;

pub use chunker::{ChunkResult, TextChunker};
pub use lopdf_parser::LoPdfParser;
pub use parser::{DocumentParser, ParsedDocument};
pub use type_detector::{DocumentGenre, TypeDetector};
