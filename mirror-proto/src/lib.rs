//! Client bindings for the two streaming feeds the worker consumes.
//!
//! The message definitions are wire-compatible subsets of the upstream
//! Yellowstone geyser and Substreams v2 protocols: only the fields the mirror
//! reads are declared, everything else is skipped by prost on decode.

pub mod geyser {
    tonic::include_proto!("geyser");
}

pub mod solana {
    pub mod storage {
        pub mod confirmed_block {
            tonic::include_proto!("solana.storage.confirmed_block");
        }
    }
}

pub mod sf {
    pub mod substreams {
        pub mod v1 {
            tonic::include_proto!("sf.substreams.v1");
        }
        pub mod rpc {
            pub mod v2 {
                tonic::include_proto!("sf.substreams.rpc.v2");
            }
        }
    }
}

pub mod mirror {
    pub mod v1 {
        tonic::include_proto!("mirror.v1");
    }
}
