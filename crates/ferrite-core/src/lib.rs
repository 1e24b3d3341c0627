// Copyright 2025 eraflo
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

//! # Ferrite Core
//!
//! Foundational crate containing the contracts of the rendering hardware
//! interface: the [`rhi::NativeDevice`] trait implemented by backends, the
//! plain-data types exchanged across it, the error taxonomy, the tunable
//! settings and the telemetry vocabulary shared by the other crates.
//!
//! This crate holds no pooling or allocation logic. That lives in
//! `ferrite-rhi`, while concrete backends live in `ferrite-infra`.

#![warn(missing_docs)]

pub mod rhi;
pub mod telemetry;
