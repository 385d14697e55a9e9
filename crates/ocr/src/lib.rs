pub use image;

pub mod decode;
pub mod extract;
pub mod overlay;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;

pub use decode::{
    CnpDecoder, DecodedFields, DecoderRegistry, FieldDecoder, FullNameDecoder, ParseError,
    PassthroughDecoder, SerieNrDecoder,
};
pub use extract::{clean_ocr_text, ExtractError, FieldExtractor};
pub use pipeline::{
    decode_base64_image, image_to_base64, IdCardProcessor, PipelineError, TempFileCleanup,
};
pub use preprocess::{prepare_canonical, PreprocessError};
pub use recognizer::{MockRecognizer, OcrBackend, OcrError, TesseractCli};

#[cfg(feature = "tesseract")]
pub use recognizer::tesseract_backend::TesseractRecognizer;
