pub mod extraction;
pub mod storage;
pub mod processor; // Upload → extraction → embedding → done/failed
pub mod rag;
pub mod safety;
pub mod stream_guard; // Degenerate-output detection for streamed answers
