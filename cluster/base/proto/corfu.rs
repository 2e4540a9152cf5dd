// Copyright 2021 The corfu Authors.
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

use ::corfu::protocol::{Message, Response};

/// Every role is served by one rpc, messages are dispatched by their kind at
/// the server.
#[tarpc::service]
pub trait Corfu {
    async fn handle(msg: Message) -> Response;
}
