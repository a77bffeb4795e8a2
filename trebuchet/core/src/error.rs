// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Trebuchet error types

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::result;

pub type Result<T> = result::Result<T, TrebuchetError>;

/// Errors produced by the scheduler core.
///
/// The admin path (`register`/`update`/`deregister`) surfaces the job
/// configuration variants to the caller; the resource-manager callback path
/// never propagates errors and only logs them.
#[derive(Debug)]
pub enum TrebuchetError {
    General(String),
    Internal(String),
    IoError(io::Error),
    SerdeJsonError(serde_json::Error),
    /// A job with the same name is already registered
    JobAlreadyExists(String),
    /// No job is registered under this name
    JobNotFound(String),
    /// The job configuration failed validation
    InvalidJobConfig(String),
    /// Reported by the resource-manager driver
    ResourceManager(String),
}

impl From<io::Error> for TrebuchetError {
    fn from(e: io::Error) -> Self {
        TrebuchetError::IoError(e)
    }
}

impl From<serde_json::Error> for TrebuchetError {
    fn from(e: serde_json::Error) -> Self {
        TrebuchetError::SerdeJsonError(e)
    }
}

impl From<String> for TrebuchetError {
    fn from(e: String) -> Self {
        TrebuchetError::General(e)
    }
}

impl Display for TrebuchetError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            TrebuchetError::General(desc) => write!(f, "General error: {desc}"),
            TrebuchetError::Internal(desc) => write!(f, "Internal error: {desc}"),
            TrebuchetError::IoError(e) => write!(f, "IO error: {e}"),
            TrebuchetError::SerdeJsonError(e) => write!(f, "Serde JSON error: {e}"),
            TrebuchetError::JobAlreadyExists(job) => {
                write!(f, "Job '{job}' already exists")
            }
            TrebuchetError::JobNotFound(job) => write!(f, "Job '{job}' not found"),
            TrebuchetError::InvalidJobConfig(desc) => {
                write!(f, "Invalid job configuration: {desc}")
            }
            TrebuchetError::ResourceManager(desc) => {
                write!(f, "Resource manager error: {desc}")
            }
        }
    }
}

impl Error for TrebuchetError {}
