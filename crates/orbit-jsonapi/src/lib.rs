//! JSON:API source for orbit.
//!
//! Speaks `application/vnd.api+json` over a pluggable transport; maps record
//! operations onto the JSON:API verb table, resolves remote ids through a
//! shared key map, and folds server-assigned ids back into the record graph
//! via follow-on transforms.

pub mod documents;
pub mod requests;
pub mod serializer;
pub mod source;
pub mod transport;

pub use documents::{PrimaryData, Resource, ResourceDocument, ResourceIdentifier};
pub use requests::RequestBuilder;
pub use serializer::JsonApiSerializer;
pub use source::{JsonApiSource, JsonApiSourceSettings};
pub use transport::{
    FakeTransport, HttpMethod, HttpTransport, JsonApiRequest, JsonApiResponse, JsonApiTransport,
};
