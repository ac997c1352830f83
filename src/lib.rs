//-----------------------------------------------------------------------------
// Crate xcp_monitor
// Path: src/lib.rs

//
// Reads measurement and calibration values from an ECU with XCP on Ethernet (TCP),
// using the addresses, data types and conversions found in the ECU A2L description
//
// Modules:
//   a2l         - best effort A2L reader
//   xcp         - XCP client session, CONNECT, DISCONNECT and SHORT_UPLOAD
//   catalog     - ECU and signal catalog, access to A2L description text
//   acquisition - single shot and periodic reads, publishes readings to subscribers

// Disabled clippy lints
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::wildcard_imports)]

pub mod a2l;
pub mod acquisition;
pub mod catalog;
pub mod xcp;

pub use a2l::{A2lDataType, A2lDescription, A2lError, A2lReader, Category, Conversion, MalformedBlockPolicy, ParameterDefinition};
pub use acquisition::{Acquisition, AcquisitionConfig, AcquisitionError, Reading};
pub use catalog::{Catalog, DescriptionSource, EcuDescriptor, EcuId, FileDescriptionSource, MemoryCatalog, Signal, SignalId, SignalKey};
pub use xcp::{Connector, SessionConfig, SessionState, TcpConnector, XcpError, XcpSession};
