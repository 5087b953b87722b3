//! Protobuf types for the SFU call-state blob.
//!
//! Pre-generated from `groupcall.proto`; kept in-tree so builds do not
//! require `protoc`.

/// The decrypted call state carried in a peek response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallState {
    #[prost(bytes = "vec", tag = "1")]
    pub padding: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub state_created_by: u32,
    #[prost(uint64, tag = "3")]
    pub state_created_at: u64,
    #[prost(map = "uint32, message", tag = "4")]
    pub participants: ::std::collections::HashMap<u32, call_state::Participant>,
}
/// Nested message and enum types in `CallState`.
pub mod call_state {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Participant {
        #[prost(uint32, tag = "1")]
        pub participant_id: u32,
        #[prost(oneof = "participant::Participant", tags = "2, 3")]
        pub participant: ::core::option::Option<participant::Participant>,
    }
    /// Nested message and enum types in `Participant`.
    pub mod participant {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Normal {
            #[prost(string, tag = "1")]
            pub identity: ::prost::alloc::string::String,
            #[prost(string, tag = "2")]
            pub nickname: ::prost::alloc::string::String,
        }
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Guest {
            #[prost(string, tag = "1")]
            pub name: ::prost::alloc::string::String,
        }
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Participant {
            #[prost(message, tag = "2")]
            Normal(Normal),
            #[prost(message, tag = "3")]
            Guest(Guest),
        }
    }
}
