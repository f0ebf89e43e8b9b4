//! gRPC 服务端实现
//!
//! 与 REST 接口共用 `CartStore` 与请求校验规则，负责 Proto 类型与内部模型之间的转换。

use tonic::{Request, Response, Status};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use cart_proto::cart::{
    AddItemRequest, Cart as ProtoCart, CreateCartRequest, DeleteCartRequest, DeleteCartResponse,
    DeleteItemRequest, DeleteItemResponse, GetCartRequest, LineItem as ProtoLineItem,
    UpdateCartRequest, UpdateItemRequest as ProtoUpdateItemRequest,
    cart_service_server::CartService,
};
use cart_shared::error::CartError;

use crate::dto::{CartRequest, LineItemRequest, UpdateItemRequest};
use crate::models::{Cart, LineItem};
use crate::store::CartStore;

/// 购物车 gRPC 服务
#[derive(Clone)]
pub struct CartGrpcService {
    store: CartStore,
}

impl CartGrpcService {
    pub fn new(store: CartStore) -> Self {
        Self { store }
    }
}

// ==================== 类型转换 ====================

fn datetime_to_timestamp(dt: chrono::DateTime<chrono::Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn line_item_to_proto(item: LineItem) -> ProtoLineItem {
    ProtoLineItem {
        item_id: item.item_id,
        product_name: item.product_name,
        unit_price: item.unit_price,
        quantity: i64::from(item.quantity),
        image_url: item.image_url.unwrap_or_default(),
    }
}

fn cart_to_proto(cart: Cart) -> ProtoCart {
    ProtoCart {
        id: cart.id,
        customer_id: cart.customer_id,
        items: cart.items.into_iter().map(line_item_to_proto).collect(),
        version: cart.version,
        updated_at: Some(datetime_to_timestamp(cart.updated_at)),
    }
}

fn line_item_request(item: ProtoLineItem) -> LineItemRequest {
    LineItemRequest {
        item_id: item.item_id,
        product_name: item.product_name,
        unit_price: item.unit_price,
        quantity: item.quantity,
        image_url: non_empty(item.image_url),
    }
}

fn validated<T: Validate>(request: T) -> Result<T, CartError> {
    request
        .validate()
        .map_err(|errors| CartError::InvalidRequest(errors.to_string()))?;
    Ok(request)
}

/// 按 REST 相同的规则校验整车请求并构造购物车
fn cart_from_proto(
    cart_id: &str,
    customer_id: Option<String>,
    items: Vec<ProtoLineItem>,
) -> Result<Cart, CartError> {
    let request = validated(CartRequest {
        customer_id,
        items: items.into_iter().map(line_item_request).collect(),
    })?;
    request.into_cart(cart_id)
}

fn required_item(item: Option<ProtoLineItem>) -> Result<ProtoLineItem, CartError> {
    item.ok_or_else(|| CartError::InvalidRequest("item 不能为空".to_string()))
}

#[tonic::async_trait]
impl CartService for CartGrpcService {
    #[instrument(skip(self))]
    async fn create_cart(
        &self,
        request: Request<CreateCartRequest>,
    ) -> Result<Response<ProtoCart>, Status> {
        let req = request.into_inner();
        let cart_id = Uuid::new_v4().to_string();
        let cart = cart_from_proto(&cart_id, req.customer_id, req.items)?;

        let cart = self.store.update(cart).await.map_err(Status::from)?;
        info!(cart_id = %cart.id, items = cart.items.len(), "购物车已创建");
        Ok(Response::new(cart_to_proto(cart)))
    }

    #[instrument(skip(self), fields(cart_id = %request.get_ref().cart_id))]
    async fn get_cart(
        &self,
        request: Request<GetCartRequest>,
    ) -> Result<Response<ProtoCart>, Status> {
        let req = request.into_inner();
        let cart = self.store.get(&req.cart_id).await.map_err(Status::from)?;
        Ok(Response::new(cart_to_proto(cart)))
    }

    #[instrument(skip(self), fields(cart_id = %request.get_ref().cart_id))]
    async fn update_cart(
        &self,
        request: Request<UpdateCartRequest>,
    ) -> Result<Response<ProtoCart>, Status> {
        let req = request.into_inner();
        let cart = cart_from_proto(&req.cart_id, req.customer_id, req.items)?;

        let cart = self.store.update(cart).await.map_err(Status::from)?;
        Ok(Response::new(cart_to_proto(cart)))
    }

    #[instrument(skip(self), fields(cart_id = %request.get_ref().cart_id))]
    async fn delete_cart(
        &self,
        request: Request<DeleteCartRequest>,
    ) -> Result<Response<DeleteCartResponse>, Status> {
        let req = request.into_inner();
        self.store
            .delete(&req.cart_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(DeleteCartResponse {}))
    }

    #[instrument(skip(self), fields(cart_id = %request.get_ref().cart_id))]
    async fn add_item(
        &self,
        request: Request<AddItemRequest>,
    ) -> Result<Response<ProtoCart>, Status> {
        let req = request.into_inner();
        let item = validated(line_item_request(required_item(req.item)?))?.into_line_item()?;

        let cart = self
            .store
            .add_item(&req.cart_id, item)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(cart_to_proto(cart)))
    }

    #[instrument(skip(self), fields(cart_id = %request.get_ref().cart_id, item_id = request.get_ref().item_id))]
    async fn update_item(
        &self,
        request: Request<ProtoUpdateItemRequest>,
    ) -> Result<Response<ProtoCart>, Status> {
        let req = request.into_inner();
        let item = required_item(req.item)?;
        let update = validated(UpdateItemRequest {
            product_name: item.product_name,
            unit_price: item.unit_price,
            quantity: item.quantity,
            image_url: non_empty(item.image_url),
        })?;

        let cart = self
            .store
            .update_item(&req.cart_id, req.item_id, update.into_line_item(req.item_id)?)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(cart_to_proto(cart)))
    }

    #[instrument(skip(self), fields(cart_id = %request.get_ref().cart_id, item_id = request.get_ref().item_id))]
    async fn delete_item(
        &self,
        request: Request<DeleteItemRequest>,
    ) -> Result<Response<DeleteItemResponse>, Status> {
        let req = request.into_inner();
        let cart = self
            .store
            .delete_item(&req.cart_id, req.item_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(DeleteItemResponse {
            cart: cart.map(cart_to_proto),
        }))
    }
}
