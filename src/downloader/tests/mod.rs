use super::test_helpers::*;
use super::*;
use crate::error::{Error, ErrorCode, TransferError};
use crate::types::{Status, TaskFilter, TaskOptions};
