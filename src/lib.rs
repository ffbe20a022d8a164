pub mod applier;
pub mod calendar;
pub mod completion;
pub mod config;
pub mod credentials;
pub mod error;
pub mod extractor;
pub mod gmail;
pub mod google_client;
pub mod poller;
pub mod schema;
pub mod sheets;

pub use applier::{ActionRequest, ActionResult, Applier, Artifact, Operation};
pub use error::{Failure, FailureKind};
pub use extractor::{ExtractionRequest, ExtractionResult, Extractor};
pub use poller::{ChangeNotification, ColumnPoller, PollerState};
pub use schema::{Field, FieldType, FieldValue, Record, Schema};
