pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use itertools::Itertools as _;
#[cfg(feature = "profiling")]
pub use lazy_static::lazy_static;
pub use log::{info, warn};
pub use noisy_float::prelude::*;
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    collections::HashSet,
    fmt::Debug,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
pub use tch::{
    kind::FLOAT_CPU,
    nn, Device, IndexOp, Kind, Tensor,
};

pub type Fallible<T> = Result<T, Error>;
