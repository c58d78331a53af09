// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Query translation, response decoding and live tailing for VictoriaLogs.

pub mod client;
pub mod datasource;
pub mod decode;
pub mod error;
pub mod frame;
pub mod interval;
pub mod query;
pub mod settings;
pub mod stream;
pub mod tail;
pub mod timestamp;
pub mod translate;

pub use datasource::{DataResponse, Datasource};
pub use error::AppError;
