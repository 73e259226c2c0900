// SPDX-License-Identifier: MPL-2.0

//! The prelude.

pub type Result<T> = core::result::Result<T, crate::error::Error>;

pub(crate) use alloc::{
    boxed::Box,
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
pub(crate) use core::ops::Range;

pub(crate) use log::{debug, error, info, trace, warn};

pub(crate) use crate::error::Error;
pub use crate::mm::{Daddr, PAGE_SIZE, Paddr};
