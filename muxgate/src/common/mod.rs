// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod protocol;
pub mod sessions;
pub mod upstream;
pub mod validation;
