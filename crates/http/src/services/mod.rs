//! Built-in services covering the HTTP/1.1 protocol work of each stage.
//!
//! | stage | service | priority |
//! |---|---|---|
//! | ReadRequest | [`RequestReader`] | 0 |
//! | ParseRequest | [`RequestParser`] | 0 |
//! | ParseRequest | [`ExpectContinue`] | 10 |
//! | ProcessDocument | [`RangeService`] | 100 |
//! | CreateResponse | [`ResponseCreator`] | 0 |
//! | SendResponse | [`ResponseSender`] | 0 |
//! | Cleanup | [`BodyDrain`] | 0 |
//!
//! Applications add their own services, typically at `CreateDocument`, next to these.

mod body_drain;
mod expect_continue;
mod range;
mod request_parser;
mod request_reader;
mod response_creator;
mod response_sender;

pub use body_drain::BodyDrain;
pub use expect_continue::ExpectContinue;
pub use range::RangeService;
pub use request_parser::RequestParser;
pub use request_reader::RequestReader;
pub use response_creator::ResponseCreator;
pub use response_sender::ResponseSender;

use crate::pipeline::{ServiceId, Services};

/// Registers every built-in service.
pub fn register_defaults(services: &Services) -> Vec<ServiceId> {
    vec![
        services.add(RequestReader),
        services.add(RequestParser),
        services.add(ExpectContinue),
        services.add(RangeService),
        services.add(ResponseCreator),
        services.add(ResponseSender),
        services.add(BodyDrain),
    ]
}
